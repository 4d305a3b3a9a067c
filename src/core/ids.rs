use chrono::Utc;
use uuid::Uuid;

/// Builds a ledger identifier of the form `<prefix>_<unix-millis>_<random>`.
///
/// The random suffix is the first nine hex digits of a v4 UUID, which keeps ids
/// short while making collisions within the same millisecond negligible.
pub fn generate_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), &random[..9])
}

pub fn request_id() -> String {
    generate_id("req")
}

pub fn call_id() -> String {
    generate_id("call")
}

pub fn connection_id() -> String {
    generate_id("ws")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "req");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(call_id(), call_id());
    }
}
