//! Random identifier generation

use rand::Rng;

const ID_LENGTH: usize = 16;
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random lowercase alphanumeric identifier.
///
/// Used for session, deployment, and alert IDs. 16 characters from a
/// 36-character alphabet is far beyond collision range for the volumes a
/// single coordinator handles.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
