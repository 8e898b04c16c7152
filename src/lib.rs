//! # Heimdall (Token & Session Security Core)
//!
//! `heimdall` turns a successful primary authentication into a session and a
//! pair of signed tokens, and keeps that session honest for the rest of its life.
//!
//! ## Tokens
//!
//! Access and refresh tokens are RS256 `JWT`s signed with the single active key.
//! Rotated keys stay **retiring** and are still published in the `JWKS` until
//! every token they could have signed has expired, so relying parties verify
//! offline without coordination.
//!
//! ## Refresh Rotation & Reuse Detection
//!
//! Every refresh swaps both token ids on the session with a compare-and-swap.
//! Presenting an already rotated refresh token is treated as theft: all of the
//! user's sessions are revoked and a `high` security event is recorded. The
//! caller only ever sees a generic failure.
//!
//! ## Risk, Lockout & Incidents
//!
//! - **Risk:** device fingerprints, impossible travel and session churn add up to
//!   a `0..=100` score that decides whether a login is allowed, flagged or denied.
//! - **Brute force:** failed attempts per credential lock the account for a
//!   while; endpoint classes are rate limited per client.
//! - **Incidents:** a fixed response table maps incidents to mitigations
//!   (revoke all sessions, require re-verification, notify) and every step is
//!   written to the security event trail.
//!
//! ## Storage
//!
//! Every store is a trait with a `PostgreSQL` and an in-memory implementation.
//! Store calls are bounded by a timeout and retried once; when a store stays
//! unreachable verification fails closed.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod incident;
pub mod risk;
pub mod rotation;
pub mod service;
pub mod session;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result, ensure};
    use std::fs;
    use std::path::PathBuf;

    // Normalize SQL to avoid brittle formatting checks in schema tests.
    fn canonical_sql() -> Result<String> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("db/sql/heimdall.sql");
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read SQL file at {}", path.display()))?;
        Ok(sql
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_lowercase())
            .collect())
    }

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn schema_sql_integrity() -> Result<()> {
        let canonical = canonical_sql()?;
        for table in [
            "signing_keys",
            "sessions",
            "security_events",
            "failed_attempts",
            "rate_limit_hits",
        ] {
            ensure!(
                canonical.contains(&format!("createtableifnotexists{table}"))
                    || canonical.contains(&format!("createunloggedtableifnotexists{table}")),
                "table {table} is missing from the schema"
            );
        }
        // One active signing key at a time.
        ensure!(canonical.contains("signing_keys_single_active"));
        ensure!(canonical.contains("createuniqueindexifnotexistssessions_refresh_jti"));
        Ok(())
    }
}
