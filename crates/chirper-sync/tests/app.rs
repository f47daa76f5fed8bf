//! End-to-end behaviour of the Chirper facade with several clients.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use chirper_backend::{Backend, BackendConfig};
use chirper_sync::{Chirper, ChirperError};
use chirper_types::{Chirp, Entry, SignUpRequest, UserProfile};

const WAIT: Duration = Duration::from_secs(5);

fn backend() -> Backend {
    Backend::open(BackendConfig::default()).unwrap()
}

fn request(email: &str, handle: &str) -> SignUpRequest {
    SignUpRequest {
        email: email.into(),
        password: "hunter22".into(),
        profile: UserProfile {
            handle: handle.into(),
            avatar_url: format!("https://example.com/{handle}.png"),
        },
    }
}

async fn chirp_with_likes(app: &Chirper, id: &str, likes: u64) -> Entry<Chirp> {
    let entries = timeout(
        WAIT,
        app.chirps()
            .wait_until(|e| e.iter().any(|c| c.id == id && c.likes == likes)),
    )
    .await
    .unwrap();
    entries.into_iter().find(|c| c.id == id).unwrap()
}

#[tokio::test]
async fn sign_up_creates_the_user_profile() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();

    let user = app.sign_up(request("ada@example.com", "ada")).await.unwrap();
    assert_eq!(app.current_user().map(|i| i.uid), Some(user.id.clone()));
    assert_eq!(app.profile(&user.id).await.unwrap(), Some(user.profile.clone()));

    let mut users = app.users().watch();
    timeout(
        WAIT,
        users.wait_for(|u| u.as_ref().is_some_and(|m| m.contains_key(&user.id))),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(app.handle_for(&user.id).as_deref(), Some("ada"));
}

#[tokio::test]
async fn duplicate_sign_up_is_rejected() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();
    app.sign_up(request("ada@example.com", "ada")).await.unwrap();

    let err = app.sign_up(request("ADA@example.com", "ada2")).await.unwrap_err();
    assert!(matches!(err, ChirperError::Auth(chirper_types::AuthError::EmailInUse)));
}

#[tokio::test]
async fn posted_chirps_arrive_in_order_with_their_fields() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();
    let user = app.sign_up(request("ada@example.com", "ada")).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(app.post_chirp(&format!("chirp {i}")).await.unwrap());
    }

    let chirps = timeout(WAIT, app.chirps().wait_until(|e| e.len() == 5))
        .await
        .unwrap();
    assert_eq!(chirps.iter().map(|c| c.id.clone()).collect::<Vec<_>>(), ids);
    for (i, chirp) in chirps.iter().enumerate() {
        assert_eq!(chirp.text, format!("chirp {i}"));
        assert_eq!(chirp.author_id, user.id);
        assert_eq!(chirp.likes, 0);
        assert!(chirp.created_at.resolved().is_some());
    }
}

#[tokio::test]
async fn a_second_client_sees_the_same_feed_once() {
    let backend = backend();
    let author = Chirper::local(&backend).await.unwrap();
    let reader = Chirper::local(&backend).await.unwrap();
    author.sign_up(request("ada@example.com", "ada")).await.unwrap();

    for text in ["one", "two", "three"] {
        author.post_chirp(text).await.unwrap();
    }

    let seen_by_author = timeout(WAIT, author.chirps().wait_until(|e| e.len() == 3))
        .await
        .unwrap();
    let seen_by_reader = timeout(WAIT, reader.chirps().wait_until(|e| e.len() == 3))
        .await
        .unwrap();
    assert_eq!(seen_by_author, seen_by_reader);
}

#[tokio::test]
async fn sequential_likes_all_count() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();
    app.sign_up(request("ada@example.com", "ada")).await.unwrap();
    let id = app.post_chirp("like me").await.unwrap();

    for n in 0..4 {
        let chirp = chirp_with_likes(&app, &id, n).await;
        app.like(&chirp).await.unwrap();
    }
    chirp_with_likes(&app, &id, 4).await;
}

#[tokio::test]
async fn concurrent_likes_of_a_stale_copy_lose_one() {
    let backend = backend();
    let a = Chirper::local(&backend).await.unwrap();
    let b = Chirper::local(&backend).await.unwrap();
    a.sign_up(request("ada@example.com", "ada")).await.unwrap();
    let id = a.post_chirp("popular").await.unwrap();

    let mut five = chirp_with_likes(&a, &id, 0).await;
    five.likes = 5;
    a.chirps().save(&five).await.unwrap();

    let seen_a = chirp_with_likes(&a, &id, 5).await;
    let seen_b = chirp_with_likes(&b, &id, 5).await;
    let (ra, rb) = tokio::join!(a.like(&seen_a), b.like(&seen_b));
    ra.unwrap();
    rb.unwrap();

    chirp_with_likes(&a, &id, 6).await;
    chirp_with_likes(&b, &id, 6).await;
}

#[tokio::test]
async fn sign_out_notifies_once_and_blocks_posting() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();
    let user = app.sign_up(request("ada@example.com", "ada")).await.unwrap();

    let calls: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let record = calls.clone();
    app.session()
        .on_auth_state_changed(move |who| record.lock().unwrap().push(who.map(|i| i.uid.clone())));

    app.sign_out().await;
    app.sign_out().await;

    assert_eq!(*calls.lock().unwrap(), vec![Some(user.id), None]);
    assert!(matches!(
        app.post_chirp("hello?").await,
        Err(ChirperError::NotSignedIn)
    ));
}

#[tokio::test]
async fn empty_chirps_are_rejected() {
    let backend = backend();
    let app = Chirper::local(&backend).await.unwrap();
    app.sign_up(request("ada@example.com", "ada")).await.unwrap();

    assert!(matches!(app.post_chirp("   ").await, Err(ChirperError::EmptyChirp)));
}

#[tokio::test]
async fn pad_converges_to_the_last_edit() {
    let backend = backend();
    let a = Chirper::local(&backend).await.unwrap();
    let b = Chirper::local(&backend).await.unwrap();

    a.edit_pad("A").await.unwrap();
    b.edit_pad("AB").await.unwrap();

    for app in [&a, &b] {
        let mut pad = app.pad().watch();
        timeout(WAIT, pad.wait_for(|d| d.as_ref().is_some_and(|d| d.text == "AB")))
            .await
            .unwrap()
            .unwrap();
    }
}
