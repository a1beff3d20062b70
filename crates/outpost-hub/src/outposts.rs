use anyhow::{bail, Context};
use async_trait::async_trait;
use outpost_core::{AccessGate, CallerIdentity, OutpostDirectory, OutpostRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutpostsFile {
    #[serde(default)]
    pub outposts: Vec<OutpostRecord>,
    #[serde(default)]
    pub principals: Vec<PrincipalEntry>,
}

/// A bearer token and the outposts its holder may view.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrincipalEntry {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub outposts: Vec<String>,
}

/// File-backed outpost directory and access gate.
#[derive(Debug, Default)]
pub struct OutpostCatalog {
    outposts: HashMap<String, OutpostRecord>,
    principals_by_token: HashMap<String, String>,
    grants: HashMap<String, HashSet<String>>,
}

impl OutpostCatalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading outposts file {}", path.display()))?;
        let file: OutpostsFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing outposts file {}", path.display()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: OutpostsFile) -> anyhow::Result<Self> {
        let mut catalog = Self::default();
        for outpost in file.outposts {
            if outpost.id.trim().is_empty() {
                bail!("outpost with empty id");
            }
            if catalog.outposts.contains_key(&outpost.id) {
                bail!("duplicate outpost id {}", outpost.id);
            }
            catalog.outposts.insert(outpost.id.clone(), outpost);
        }
        for principal in file.principals {
            if principal.name.trim().is_empty() || principal.token.trim().is_empty() {
                bail!("principal entries need a name and a token");
            }
            if catalog.grants.contains_key(&principal.name) {
                bail!("duplicate principal {}", principal.name);
            }
            if catalog
                .principals_by_token
                .insert(principal.token, principal.name.clone())
                .is_some()
            {
                bail!("token of principal {} is already in use", principal.name);
            }
            catalog
                .grants
                .insert(principal.name, principal.outposts.into_iter().collect());
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.outposts.len()
    }

    /// Map a bearer token to the principal it belongs to.
    pub fn caller_for_token(&self, token: &str) -> CallerIdentity {
        self.principals_by_token
            .get(token)
            .map(|name| CallerIdentity::new(name.as_str()))
            .unwrap_or_else(CallerIdentity::anonymous)
    }
}

#[async_trait]
impl OutpostDirectory for OutpostCatalog {
    async fn lookup(&self, outpost_id: &str) -> Option<OutpostRecord> {
        self.outposts.get(outpost_id).cloned()
    }
}

#[async_trait]
impl AccessGate for OutpostCatalog {
    async fn is_authorized(&self, caller: &CallerIdentity, outpost_id: &str) -> bool {
        if caller.is_anonymous() {
            return false;
        }
        self.grants
            .get(caller.as_str())
            .is_some_and(|outposts| outposts.contains(outpost_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn sample_file() -> OutpostsFile {
        serde_json::from_value(serde_json::json!({
            "outposts": [
                {"id": "proxy-1", "name": "Edge proxy"},
                {"id": "ldap-1", "name": "LDAP"}
            ],
            "principals": [
                {"name": "proxy-bot", "token": "tok-proxy", "outposts": ["proxy-1", "ghost"]},
                {"name": "ops", "token": "tok-ops", "outposts": ["proxy-1", "ldap-1"]}
            ]
        }))
        .expect("sample outposts file")
    }

    #[tokio::test]
    async fn gate_honours_grants_per_principal() {
        let catalog = OutpostCatalog::from_file(sample_file()).expect("catalog");
        let bot = catalog.caller_for_token("tok-proxy");
        let ops = catalog.caller_for_token("tok-ops");
        let stranger = catalog.caller_for_token("nope");

        assert_eq!(bot, CallerIdentity::new("proxy-bot"));
        assert!(stranger.is_anonymous());
        assert!(catalog.is_authorized(&bot, "proxy-1").await);
        assert!(!catalog.is_authorized(&bot, "ldap-1").await);
        assert!(catalog.is_authorized(&ops, "ldap-1").await);
        assert!(!catalog.is_authorized(&stranger, "proxy-1").await);
    }

    #[tokio::test]
    async fn directory_only_knows_declared_outposts() {
        let catalog = OutpostCatalog::from_file(sample_file()).expect("catalog");
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.lookup("proxy-1").await.map(|record| record.name),
            Some("Edge proxy".to_string())
        );
        assert!(catalog.lookup("ghost").await.is_none());
    }

    #[test]
    fn rejects_duplicates_and_blank_entries() {
        let mut duplicate_outpost = sample_file();
        duplicate_outpost.outposts.push(OutpostRecord {
            id: "proxy-1".to_string(),
            name: String::new(),
        });
        assert!(OutpostCatalog::from_file(duplicate_outpost).is_err());

        let mut shared_token = sample_file();
        shared_token.principals.push(PrincipalEntry {
            name: "other".to_string(),
            token: "tok-ops".to_string(),
            outposts: Vec::new(),
        });
        assert!(OutpostCatalog::from_file(shared_token).is_err());

        let mut blank = sample_file();
        blank.outposts.push(OutpostRecord {
            id: " ".to_string(),
            name: String::new(),
        });
        assert!(OutpostCatalog::from_file(blank).is_err());
    }

    #[test]
    fn loads_from_disk_and_reports_bad_json() {
        let mut good = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            good,
            "{}",
            serde_json::to_string(&sample_file()).expect("encode")
        )
        .expect("write");
        let catalog = OutpostCatalog::load(good.path()).expect("load");
        assert_eq!(catalog.len(), 2);

        let mut bad = tempfile::NamedTempFile::new().expect("tempfile");
        write!(bad, "{{\"outposts\": [").expect("write");
        let err = OutpostCatalog::load(bad.path()).expect_err("bad json");
        assert!(err.to_string().contains("parsing outposts file"));
    }
}
