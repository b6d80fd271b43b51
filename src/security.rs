//! Process guards and operator authentication shared by the binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Operator bearer token. Only its BLAKE3 digest is kept in memory and
/// presented tokens are compared digest to digest.
#[derive(Clone)]
pub struct AdminToken {
    digest: blake3::Hash,
}

impl AdminToken {
    pub fn new(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.len() < 16 {
            bail!("admin token must be at least 16 characters");
        }
        Ok(Self {
            digest: blake3::hash(token.as_bytes()),
        })
    }

    /// `blake3::Hash` equality is constant-time.
    pub fn verify(&self, presented: &str) -> bool {
        blake3::hash(presented.trim().as_bytes()) == self.digest
    }

    /// Checks an `Authorization` header value of the form `Bearer <token>`.
    pub fn verify_bearer(&self, header: &str) -> bool {
        header
            .strip_prefix("Bearer ")
            .is_some_and(|token| self.verify(token))
    }
}

impl std::fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminToken(..)")
    }
}
