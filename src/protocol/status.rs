use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Failure},
    Rank,
};

/// Outcome of one command's effect on one rank.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum StatusReport {
    Ok,
    UserError(String),
    InternalError(String),
    NotRegistered(String),
}

impl StatusReport {
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusReport::Ok)
    }

    fn into_failure(self) -> Option<Failure> {
        match self {
            StatusReport::Ok => None,
            StatusReport::UserError(message) => Some(Failure::User(message)),
            StatusReport::InternalError(message) => Some(Failure::Internal(message)),
            StatusReport::NotRegistered(name) => Some(Failure::NotRegistered(name)),
        }
    }
}

impl From<&Result<(), Failure>> for StatusReport {
    fn from(outcome: &Result<(), Failure>) -> Self {
        match outcome {
            Ok(()) => StatusReport::Ok,
            Err(Failure::User(message)) => StatusReport::UserError(message.clone()),
            Err(Failure::Internal(message)) => StatusReport::InternalError(message.clone()),
            Err(Failure::NotRegistered(name)) => StatusReport::NotRegistered(name.clone()),
        }
    }
}

/// Folds the reports of all ranks into one result. A fatal report anywhere
/// wins over user errors; among reports of the same severity the lowest rank
/// wins.
pub fn evaluate<I>(reports: I) -> Result<(), Error>
where
    I: IntoIterator<Item = (Rank, StatusReport)>,
{
    let mut first_user_error = None;
    for (rank, report) in reports {
        match report.into_failure() {
            None => {}
            Some(Failure::User(message)) => {
                debug!("rank {} reported user error: {}", rank, message);
                first_user_error.get_or_insert(Error::User { rank, message });
            }
            Some(fatal) => return Err(Error::from_failure(rank, fatal)),
        }
    }
    match first_user_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ok_passes() {
        let reports = (0..4).map(|rank| (rank, StatusReport::Ok));
        assert!(evaluate(reports).is_ok());
    }

    #[test]
    fn user_error_carries_message_and_rank() {
        let reports = vec![
            (0, StatusReport::Ok),
            (1, StatusReport::Ok),
            (2, StatusReport::UserError("bad value".into())),
            (3, StatusReport::UserError("worse value".into())),
        ];
        match evaluate(reports) {
            Err(Error::User { rank, message }) => {
                assert_eq!(rank, 2);
                assert_eq!(message, "bad value");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn internal_error_outranks_user_error() {
        let reports = vec![
            (1, StatusReport::UserError("bad value".into())),
            (3, StatusReport::InternalError("unknown object id 4".into())),
        ];
        let err = evaluate(reports).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Internal { rank: 3, .. }));
    }

    #[test]
    fn not_registered_is_fatal() {
        let reports = vec![(2, StatusReport::NotRegistered("Counter".into()))];
        let err = evaluate(reports).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "rank 2 has not registered \"Counter\"");
    }
}
