//! `Request::credentials` shape (spec §9's SSO open question): the crate
//! exposes the same `Credentials` data the original `seasocks` did, but
//! leaves population to an authentication hook an embedder registers like a
//! page handler — there is no SSO/auth subsystem wired into the mainline
//! request path here.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub authenticated: bool,
    pub username: String,
    pub groups: BTreeSet<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Credentials {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// The string the stats JSON endpoint shows for this request's user
    /// (spec §6's stats keys: `user` or `(not authed)`).
    pub fn display_name(&self) -> &str {
        if self.authenticated {
            &self.username
        } else {
            "(not authed)"
        }
    }
}
