//! Collection names used across the platform.

pub const CLIENT: &str = "Client";
pub const CWE: &str = "CWE";
pub const FINDING: &str = "Finding";
pub const NOTIFICATION: &str = "Notification";
pub const OWASP: &str = "OWASP";
pub const REMEDIATION: &str = "Remediation";
pub const REPOSITORY: &str = "Repository";
pub const RULES: &str = "Rules";
pub const USERS: &str = "Users";
pub const INVITATIONS: &str = "Invitations";

/// Every known collection
pub const ALL: &[&str] = &[
    CLIENT,
    CWE,
    FINDING,
    NOTIFICATION,
    OWASP,
    REMEDIATION,
    REPOSITORY,
    RULES,
    USERS,
    INVITATIONS,
];
