//! User-Agent sent with download requests.

/// Identifies the tool and version to servers.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    format!("{name}/{version} (resumable-download-engine)")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_name_and_version() {
        let ua = default_download_user_agent();
        let version = ua
            .strip_prefix(concat!(env!("CARGO_PKG_NAME"), "/"))
            .and_then(|rest| rest.split(' ').next())
            .unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
        assert!(ua.ends_with("(resumable-download-engine)"), "{ua}");
    }
}
