//! Keysets: a named group of certificate/key items with one primary

use crate::cert::{Certificate, PrivateKey, Signer};
use crate::error::{PkiError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// One certificate (and optionally its key) inside a [`Keyset`]
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetItem {
    /// Decimal serial of the certificate
    pub id: String,
    pub certificate: Certificate,
    pub private_key: Option<PrivateKey>,
    pub distrust_timestamp: Option<DateTime<Utc>>,
}

impl KeysetItem {
    pub fn new(certificate: Certificate, private_key: Option<PrivateKey>) -> Result<Self> {
        let id = certificate.serial()?;
        Ok(Self {
            id,
            certificate,
            private_key,
            distrust_timestamp: None,
        })
    }

    pub fn is_distrusted(&self) -> bool {
        self.distrust_timestamp.is_some()
    }
}

/// Compare decimal serial ids numerically
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// A named set of keypair items.
///
/// Exactly one item is primary; the primary has a private key and is never
/// distrusted. Items are kept in ascending id order.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyset {
    name: String,
    primary_id: Option<String>,
    items: Vec<KeysetItem>,
}

impl Keyset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_id: None,
            items: Vec::new(),
        }
    }

    /// Rebuild a keyset from stored parts, checking its invariants
    pub fn from_parts(
        name: impl Into<String>,
        primary_id: Option<String>,
        mut items: Vec<KeysetItem>,
    ) -> Result<Self> {
        items.sort_by(|a, b| compare_ids(&a.id, &b.id));
        let keyset = Self {
            name: name.into(),
            primary_id,
            items,
        };
        keyset.validate()?;
        Ok(keyset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_id(&self) -> Option<&str> {
        self.primary_id.as_deref()
    }

    pub fn items(&self) -> &[KeysetItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, id: &str) -> Option<&KeysetItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn primary(&self) -> Option<&KeysetItem> {
        self.primary_id.as_deref().and_then(|id| self.item(id))
    }

    /// Signing material of the primary item
    pub fn signer(&self) -> Result<Signer> {
        let primary = self
            .primary()
            .ok_or_else(|| PkiError::NoPrimary(self.name.clone()))?;
        let private_key = primary
            .private_key
            .clone()
            .ok_or_else(|| PkiError::NoPrimary(self.name.clone()))?;
        Ok(Signer {
            certificate: primary.certificate.clone(),
            private_key,
        })
    }

    /// Check the single-primary invariant
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            if self.primary_id.is_some() {
                return Err(PkiError::invalid(&self.name, "primary set on empty keyset"));
            }
            return Ok(());
        }
        let primary = self
            .primary()
            .ok_or_else(|| PkiError::NoPrimary(self.name.clone()))?;
        if primary.private_key.is_none() {
            return Err(PkiError::invalid(&self.name, "primary item has no private key"));
        }
        if primary.is_distrusted() {
            return Err(PkiError::invalid(&self.name, "primary item is distrusted"));
        }
        Ok(())
    }

    /// Add an item. The first item always becomes primary.
    pub fn add_item(&mut self, item: KeysetItem, make_primary: bool) -> Result<()> {
        if self.item(&item.id).is_some() {
            return Err(PkiError::ItemExists {
                keyset: self.name.clone(),
                id: item.id,
            });
        }
        let make_primary = make_primary || self.items.is_empty();
        if make_primary {
            if item.private_key.is_none() {
                return Err(PkiError::invalid(
                    &self.name,
                    format!("item {} has no private key and cannot be primary", item.id),
                ));
            }
            if item.is_distrusted() {
                return Err(PkiError::invalid(
                    &self.name,
                    format!("item {} is distrusted and cannot be primary", item.id),
                ));
            }
        }
        let id = item.id.clone();
        let pos = self
            .items
            .partition_point(|i| compare_ids(&i.id, &id) == Ordering::Less);
        self.items.insert(pos, item);
        if make_primary {
            self.primary_id = Some(id);
        }
        Ok(())
    }

    pub fn promote(&mut self, id: &str) -> Result<()> {
        let item = self.require(id)?;
        if item.private_key.is_none() {
            return Err(PkiError::invalid(
                &self.name,
                format!("item {} has no private key", id),
            ));
        }
        if item.is_distrusted() {
            return Err(PkiError::invalid(
                &self.name,
                format!("item {} is distrusted", id),
            ));
        }
        self.primary_id = Some(id.to_string());
        Ok(())
    }

    pub fn distrust(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if self.primary_id.as_deref() == Some(id) {
            return Err(PkiError::invalid(
                &self.name,
                format!("cannot distrust primary item {}", id),
            ));
        }
        let item = self.require_mut(id)?;
        if item.distrust_timestamp.is_none() {
            item.distrust_timestamp = Some(at);
        }
        Ok(())
    }

    pub fn trust(&mut self, id: &str) -> Result<()> {
        self.require_mut(id)?.distrust_timestamp = None;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<KeysetItem> {
        if self.primary_id.as_deref() == Some(id) {
            return Err(PkiError::invalid(
                &self.name,
                format!("cannot delete primary item {}", id),
            ));
        }
        let pos = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| self.not_found(id))?;
        Ok(self.items.remove(pos))
    }

    /// Trusted items newer than the primary, i.e. staged for promotion
    pub fn staged_items(&self) -> Vec<&KeysetItem> {
        let Some(primary) = self.primary_id.as_deref() else {
            return Vec::new();
        };
        self.items
            .iter()
            .filter(|i| !i.is_distrusted() && compare_ids(&i.id, primary) == Ordering::Greater)
            .collect()
    }

    /// Trusted items older than the primary
    pub fn superseded_items(&self) -> Vec<&KeysetItem> {
        let Some(primary) = self.primary_id.as_deref() else {
            return Vec::new();
        };
        self.items
            .iter()
            .filter(|i| !i.is_distrusted() && compare_ids(&i.id, primary) == Ordering::Less)
            .collect()
    }

    pub fn distrusted_items(&self) -> Vec<&KeysetItem> {
        self.items.iter().filter(|i| i.is_distrusted()).collect()
    }

    /// Certificates nodes should trust: the primary first, then every
    /// other non-distrusted item in ascending id order.
    pub fn trust_bundle(&self) -> Vec<&Certificate> {
        let mut bundle = Vec::new();
        if let Some(primary) = self.primary() {
            bundle.push(&primary.certificate);
        }
        for item in &self.items {
            if Some(item.id.as_str()) == self.primary_id.as_deref() || item.is_distrusted() {
                continue;
            }
            bundle.push(&item.certificate);
        }
        bundle
    }

    pub fn trust_bundle_pem(&self) -> String {
        let mut out = String::new();
        for cert in self.trust_bundle() {
            out.push_str(cert.pem());
            if !cert.pem().ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    fn require(&self, id: &str) -> Result<&KeysetItem> {
        self.item(id).ok_or_else(|| self.not_found(id))
    }

    fn require_mut(&mut self, id: &str) -> Result<&mut KeysetItem> {
        let err = self.not_found(id);
        self.items.iter_mut().find(|i| i.id == id).ok_or(err)
    }

    fn not_found(&self, id: &str) -> PkiError {
        PkiError::ItemNotFound {
            keyset: self.name.clone(),
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertType, IssueCertRequest, Subject, issue_certificate};

    fn ca_item(serial: &str, with_key: bool) -> KeysetItem {
        let (cert, key) = issue_certificate(
            &IssueCertRequest {
                cert_type: CertType::Ca,
                subject: Subject::cn("kubernetes-ca"),
                alternate_names: vec![],
                serial: serial.to_string(),
                private_key: None,
                validity_days: None,
            },
            None,
        )
        .unwrap();
        KeysetItem::new(cert, with_key.then_some(key)).unwrap()
    }

    #[test]
    fn test_first_item_is_primary() {
        let mut ks = Keyset::new("kubernetes-ca");
        ks.add_item(ca_item("10", true), false).unwrap();
        assert_eq!(ks.primary_id(), Some("10"));
        ks.validate().unwrap();
    }

    #[test]
    fn test_primary_requires_private_key() {
        let mut ks = Keyset::new("kubernetes-ca");
        let err = ks.add_item(ca_item("10", false), false).unwrap_err();
        assert!(matches!(err, PkiError::InvalidOperation { .. }));
        assert!(ks.is_empty());
    }

    #[test]
    fn test_items_sorted_numerically() {
        let mut ks = Keyset::new("ca");
        ks.add_item(ca_item("100", true), false).unwrap();
        ks.add_item(ca_item("9", true), false).unwrap();
        ks.add_item(ca_item("20", false), false).unwrap();
        let ids: Vec<_> = ks.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["9", "20", "100"]);
        assert_eq!(ks.primary_id(), Some("100"));
    }

    #[test]
    fn test_cannot_distrust_or_remove_primary() {
        let mut ks = Keyset::new("ca");
        ks.add_item(ca_item("1", true), false).unwrap();
        assert!(ks.distrust("1", Utc::now()).is_err());
        assert!(ks.remove("1").is_err());
    }

    #[test]
    fn test_promote_distrust_trust_cycle() {
        let mut ks = Keyset::new("ca");
        ks.add_item(ca_item("1", true), false).unwrap();
        ks.add_item(ca_item("2", true), false).unwrap();
        assert_eq!(ks.staged_items().len(), 1);

        ks.promote("2").unwrap();
        assert_eq!(ks.primary_id(), Some("2"));
        assert_eq!(ks.superseded_items().len(), 1);

        ks.distrust("1", Utc::now()).unwrap();
        assert!(ks.promote("1").is_err());
        assert_eq!(ks.distrusted_items().len(), 1);

        ks.trust("1").unwrap();
        assert!(ks.distrusted_items().is_empty());
        ks.validate().unwrap();
    }

    #[test]
    fn test_trust_bundle_order() {
        let mut ks = Keyset::new("ca");
        let a = ca_item("1", true);
        let b = ca_item("2", true);
        let c = ca_item("3", true);
        let (pa, pb, pc) = (
            a.certificate.pem().to_string(),
            b.certificate.pem().to_string(),
            c.certificate.pem().to_string(),
        );
        ks.add_item(a, false).unwrap();
        ks.add_item(b, false).unwrap();
        ks.add_item(c, false).unwrap();
        ks.promote("2").unwrap();

        let bundle = ks.trust_bundle_pem();
        assert!(bundle.starts_with(&pb));
        assert_eq!(bundle, format!("{}{}{}", pb, pa, pc));

        ks.distrust("1", Utc::now()).unwrap();
        assert_eq!(ks.trust_bundle_pem(), format!("{}{}", pb, pc));
    }

    #[test]
    fn test_from_parts_rejects_distrusted_primary() {
        let mut item = ca_item("1", true);
        item.distrust_timestamp = Some(Utc::now());
        let err = Keyset::from_parts("ca", Some("1".to_string()), vec![item]).unwrap_err();
        assert!(matches!(err, PkiError::InvalidOperation { .. }));
    }
}
