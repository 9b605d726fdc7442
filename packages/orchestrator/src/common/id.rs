//! Primary-key generation.

use uuid::Uuid;

/// Mint a new row id.
///
/// V7 UUIDs are time-ordered, so primary keys double as a stable creation
/// ordering and keep index locality under heavy insert load.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(db_id(), db_id());
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = db_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = db_id();
        assert!(a < b);
    }
}
