//! Dialpad rule: only the configured hotline places a call.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dial {hotline} only")]
pub struct DialRejected {
    pub hotline: String,
    pub dialed: String,
}

/// Accept `dialed` if it matches `hotline` (surrounding whitespace ignored).
pub fn check_dialed(dialed: &str, hotline: &str) -> Result<(), DialRejected> {
    if dialed.trim() == hotline.trim() {
        Ok(())
    } else {
        Err(DialRejected {
            hotline: hotline.trim().to_string(),
            dialed: dialed.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_hotline_is_accepted() {
        assert!(check_dialed("311", "311").is_ok());
        assert!(check_dialed(" 311\n", "311").is_ok());

        let err = check_dialed("911", "311").unwrap_err();
        assert_eq!(err.to_string(), "Dial 311 only");
        assert_eq!(err.dialed, "911");
        assert!(check_dialed("", "311").is_err());
    }
}
