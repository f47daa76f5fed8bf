use rand::Rng;

/// Alphabet in ASCII order, so generated keys sort by creation time.
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Generates 20-character keys for appended children.
///
/// The first 8 characters encode the millisecond clock, the remaining 12 are
/// random. Keys generated within the same millisecond increment the random
/// part instead, so keys are strictly increasing.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_time: i64,
    last_random: [u8; RANDOM_CHARS],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, now_millis: i64) -> String {
        // A clock that steps backwards must not reorder keys.
        let mut now = now_millis.max(self.last_time);

        if now == self.last_time {
            if !increment(&mut self.last_random) {
                now += 1;
                self.fill_random();
            }
        } else {
            self.fill_random();
        }
        self.last_time = now;

        let mut id = String::with_capacity(TIME_CHARS + RANDOM_CHARS);
        let mut time_chars = [0u8; TIME_CHARS];
        let mut t = now;
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(t % 64) as usize];
            t /= 64;
        }
        id.extend(time_chars.iter().map(|&b| b as char));
        id.extend(self.last_random.iter().map(|&i| PUSH_CHARS[i as usize] as char));
        id
    }

    fn fill_random(&mut self) {
        let mut rng = rand::rng();
        for slot in self.last_random.iter_mut() {
            *slot = rng.random_range(0..64u8);
        }
    }
}

/// Add one to a base-64 digit string. Returns false on overflow.
fn increment(digits: &mut [u8; RANDOM_CHARS]) -> bool {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return true;
        }
    }
    false
}
