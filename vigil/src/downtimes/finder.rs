//! Ad-hoc downtime queries

use super::downtime::Downtime;

/// Read-only filter over a downtime collection
#[derive(Debug, Clone, Copy)]
pub struct DowntimeFinder<'a> {
    downtimes: &'a [Downtime],
}

impl<'a> DowntimeFinder<'a> {
    pub fn new(downtimes: &'a [Downtime]) -> Self {
        Self { downtimes }
    }

    /// Ids of every downtime matching all `(field, value)` criteria, in
    /// collection order.
    ///
    /// Fields: `host`, `service`, `start`, `end`, `fixed`, `triggered_by`,
    /// `duration`, `author`, `comment`. Strings compare exactly; a host
    /// downtime has the empty string as its service. Unknown fields and
    /// numbers that do not parse never match.
    pub fn find_matching_all<K, V>(&self, criteria: &[(K, V)]) -> Vec<u64>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.downtimes
            .iter()
            .filter(|dt| {
                criteria
                    .iter()
                    .all(|(field, value)| matches_criterion(dt, field.as_ref(), value.as_ref()))
            })
            .map(|dt| dt.id)
            .collect()
    }
}

fn matches_criterion(dt: &Downtime, field: &str, value: &str) -> bool {
    match field {
        "host" => dt.host_name() == value,
        "service" => dt.service_description().unwrap_or_default() == value,
        "start" => value.parse::<i64>().is_ok_and(|v| v == dt.start_time),
        "end" => value.parse::<i64>().is_ok_and(|v| v == dt.end_time),
        "fixed" => value.parse::<i64>().is_ok_and(|v| (v != 0) == dt.fixed),
        "triggered_by" => value.parse::<u64>().is_ok_and(|v| v == dt.triggered_by),
        "duration" => value.parse::<u64>().is_ok_and(|v| v == dt.duration),
        "author" => dt.author == value,
        "comment" => dt.comment == value,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downtimes::{DowntimeKind, DowntimeManager, DowntimeRequest};

    #[allow(clippy::too_many_arguments)]
    fn downtime(
        id: u64,
        host: &str,
        service: &str,
        start: i64,
        end: i64,
        fixed: bool,
        triggered_by: u64,
        duration: u64,
        author: &str,
        comment: &str,
    ) -> Downtime {
        let kind = if service.is_empty() {
            DowntimeKind::Host
        } else {
            DowntimeKind::Service
        };
        let request = DowntimeRequest {
            host_name: host.into(),
            service_description: (!service.is_empty()).then(|| service.to_string()),
            entry_time: start,
            author: author.into(),
            comment: comment.into(),
            start_time: start,
            end_time: end,
            fixed,
            triggered_by,
            duration,
        };
        Downtime::new(id, kind, &request)
    }

    fn manager() -> DowntimeManager {
        let mut manager = DowntimeManager::new();
        manager.insert(downtime(1, "first_host", "test_service", 123456789, 134567892, true, 0, 42, "test_author", "other_comment"));
        manager.insert(downtime(2, "test_host", "", 234567891, 134567892, true, 0, 84, "other_author", "test_comment"));
        manager.insert(downtime(3, "other_host", "other_service", 123456789, 345678921, false, 2, 42, "", "test_comment"));
        manager.insert(downtime(4, "test_host", "test_service", 234567891, 345678921, false, 2, 84, "test_author", ""));
        manager.insert(downtime(5, "other_host", "test_service", 123456789, 134567892, true, 2, 42, "test_author", "test_comment"));
        manager
    }

    fn find(manager: &DowntimeManager, criteria: &[(&str, &str)]) -> Vec<u64> {
        DowntimeFinder::new(manager.downtimes()).find_matching_all(criteria)
    }

    #[test]
    fn test_empty_collection() {
        let manager = DowntimeManager::new();
        assert!(find(&manager, &[("host", "test_host")]).is_empty());
    }

    #[test]
    fn test_no_criteria_matches_everything() {
        let manager = manager();
        assert_eq!(find(&manager, &[]), vec![1, 3, 5, 2, 4]);
    }

    #[test]
    fn test_host_in_start_time_order() {
        let manager = manager();
        assert_eq!(find(&manager, &[("host", "test_host")]), vec![2, 4]);
        assert!(find(&manager, &[("host", "anyhost")]).is_empty());
    }

    #[test]
    fn test_service() {
        let manager = manager();
        assert_eq!(find(&manager, &[("service", "test_service")]), vec![1, 5, 4]);
        assert_eq!(find(&manager, &[("service", "")]), vec![2]);
        assert!(find(&manager, &[("service", "anyservice")]).is_empty());
    }

    #[test]
    fn test_numeric_fields() {
        let manager = manager();
        assert_eq!(find(&manager, &[("start", "234567891")]), vec![2, 4]);
        assert_eq!(find(&manager, &[("end", "134567892")]), vec![1, 5, 2]);
        assert_eq!(find(&manager, &[("fixed", "0")]), vec![3, 4]);
        assert_eq!(find(&manager, &[("fixed", "1")]), vec![1, 5, 2]);
        assert_eq!(find(&manager, &[("triggered_by", "0")]), vec![1, 2]);
        assert_eq!(find(&manager, &[("duration", "84")]), vec![2, 4]);
    }

    #[test]
    fn test_malformed_number_is_no_match() {
        let manager = manager();
        assert!(find(&manager, &[("start", "soon")]).is_empty());
        assert!(find(&manager, &[("duration", "-1")]).is_empty());
    }

    #[test]
    fn test_empty_strings_match_missing_fields() {
        let manager = manager();
        assert_eq!(find(&manager, &[("author", "")]), vec![3]);
        assert_eq!(find(&manager, &[("comment", "")]), vec![4]);
    }

    #[test]
    fn test_unknown_field() {
        let manager = manager();
        assert!(find(&manager, &[("colour", "blue")]).is_empty());
    }

    #[test]
    fn test_all_criteria_must_match() {
        let manager = manager();
        let criteria = [
            ("author", "test_author"),
            ("duration", "42"),
            ("comment", "test_comment"),
        ];
        assert_eq!(find(&manager, &criteria), vec![5]);

        let criteria = [("host", "test_host"), ("service", "test_service"), ("fixed", "1")];
        assert!(find(&manager, &criteria).is_empty());
    }

    #[test]
    fn test_owned_criteria() {
        let manager = manager();
        let criteria = vec![("host".to_string(), "other_host".to_string())];
        let finder = DowntimeFinder::new(manager.downtimes());
        assert_eq!(finder.find_matching_all(&criteria), vec![3, 5]);
    }
}
