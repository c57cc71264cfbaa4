//! Job-set reconciliation between a client and the server.
//!
//! The server's running-job set is the authoritative truth clients must
//! converge to. Reconciliation is a pure set computation: it never mutates
//! the authoritative set, only returns the abort list and names the jobs
//! the server expected this client to report.

use std::collections::HashSet;

/// Outcome of reconciling one client's reported jobs against the server's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Jobs the client runs but the server does not know: abort on client.
    pub to_abort: Vec<String>,
    /// Jobs the server runs but the client no longer reports.
    pub orphaned: Vec<String>,
}

/// Compare the client-reported job IDs against the server's authoritative
/// set. Outputs are sorted so the result is deterministic for a given pair
/// of sets.
pub fn reconcile(client_jobs: &[String], server_jobs: &[String]) -> Reconciliation {
    let client: HashSet<&str> = client_jobs.iter().map(String::as_str).collect();
    let server: HashSet<&str> = server_jobs.iter().map(String::as_str).collect();

    let mut to_abort: Vec<String> = client
        .difference(&server)
        .map(|s| s.to_string())
        .collect();
    to_abort.sort();

    let mut orphaned: Vec<String> = server
        .difference(&client)
        .map(|s| s.to_string())
        .collect();
    orphaned.sort();

    Reconciliation { to_abort, orphaned }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_mixed_sets() {
        let result = reconcile(&ids(&["A", "B"]), &ids(&["B", "C"]));
        assert_eq!(result.to_abort, ids(&["A"]));
        assert_eq!(result.orphaned, ids(&["C"]));
    }

    #[test]
    fn test_reconcile_identical_sets() {
        let result = reconcile(&ids(&["A", "B"]), &ids(&["B", "A"]));
        assert!(result.to_abort.is_empty());
        assert!(result.orphaned.is_empty());
    }

    #[test]
    fn test_reconcile_is_deterministic() {
        let first = reconcile(&ids(&["X", "A", "M"]), &ids(&["B"]));
        let second = reconcile(&ids(&["M", "X", "A"]), &ids(&["B"]));
        assert_eq!(first, second);
        assert_eq!(first.to_abort, ids(&["A", "M", "X"]));
    }

    #[test]
    fn test_reconcile_does_not_mutate_inputs() {
        let client = ids(&["A"]);
        let server = ids(&["B", "C"]);
        let _ = reconcile(&client, &server);
        assert_eq!(server, ids(&["B", "C"]));
    }

    #[test]
    fn test_reconcile_empty_client() {
        let result = reconcile(&[], &ids(&["A"]));
        assert!(result.to_abort.is_empty());
        assert_eq!(result.orphaned, ids(&["A"]));
    }
}
