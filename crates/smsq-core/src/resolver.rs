//! Computes the eligible audience of a campaign.

use std::{collections::HashSet, sync::Arc};

use crate::{
    campaign::Campaign,
    domain::{OwnerId, Recipient},
    errors::Error,
    ports::{ContactStore, Store},
    Result,
};

pub struct RecipientResolver {
    contacts: Arc<dyn Store>,
}

impl RecipientResolver {
    pub fn new(contacts: Arc<dyn Store>) -> Self {
        Self { contacts }
    }

    /// Contacts of the campaign's groups minus every applicable opt-out, in contact
    /// insertion order and deduplicated by phone number (first occurrence wins).
    pub async fn resolve(&self, campaign: &Campaign) -> Result<Vec<Recipient>> {
        let known = self.contacts.owner_groups(&campaign.owner).await?;
        let missing: Vec<&str> = campaign
            .contact_groups
            .iter()
            .filter(|g| !known.contains(*g))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "contact group(s) not found for owner {}: {}",
                campaign.owner,
                missing.join(", ")
            )));
        }

        let owners = self.opt_out_owners(&campaign.owner).await?;
        let opted_out = self.contacts.find_opt_outs(&owners).await?;

        let contacts = self
            .contacts
            .find_contacts(&campaign.owner, &campaign.contact_groups)
            .await?;

        let mut seen = HashSet::new();
        let recipients: Vec<Recipient> = contacts
            .into_iter()
            .filter(|c| !opted_out.contains(&c.phone_number))
            .filter(|c| seen.insert(c.phone_number.clone()))
            .map(|c| Recipient {
                phone_number: c.phone_number,
                name: c.name,
            })
            .collect();

        if recipients.is_empty() {
            return Err(Error::EmptyAudience(campaign.id.to_string()));
        }

        tracing::debug!(
            campaign = %campaign.id,
            eligible = recipients.len(),
            excluded = opted_out.len(),
            "resolved recipients"
        );
        Ok(recipients)
    }

    /// The owner plus, for sub-accounts, the admin that created them.
    async fn opt_out_owners(&self, owner: &OwnerId) -> Result<Vec<OwnerId>> {
        let mut owners = vec![owner.clone()];
        if let Some(parent) = self
            .contacts
            .find_owner(owner)
            .await?
            .and_then(|o| o.parent)
        {
            owners.push(parent);
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        domain::{OptOutEntry, OptOutScope, Owner},
        store::MemoryStore,
        testing::{contact, sample_campaign},
    };

    fn opt_out(phone: &str, owner: &str, scope: OptOutScope) -> OptOutEntry {
        OptOutEntry {
            phone_number: phone.into(),
            reason: "test".to_string(),
            scope,
            owner: owner.into(),
            added_at: Utc::now(),
        }
    }

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .add_owner(Owner {
                id: "sub".into(),
                parent: Some("admin".into()),
            })
            .await;
        for (p, g) in [("1", "a"), ("2", "b"), ("3", "a"), ("1", "b"), ("4", "a"), ("5", "a")] {
            store.add_contact(contact("sub", p, &[g])).await;
        }
        store.add_contact(contact("other", "6", &["a"])).await;
        store
    }

    #[tokio::test]
    async fn filters_opt_outs_across_scopes_and_parent() {
        let store = seeded().await;
        store.insert_opt_out(opt_out("2", "sub", OptOutScope::Owner)).await.unwrap();
        store.insert_opt_out(opt_out("3", "admin", OptOutScope::Owner)).await.unwrap();
        store.insert_opt_out(opt_out("4", "someone", OptOutScope::Platform)).await.unwrap();
        store.insert_opt_out(opt_out("5", "someone", OptOutScope::Owner)).await.unwrap();

        let mut c = sample_campaign("c1", "sub", 50);
        c.contact_groups = vec!["a".to_string(), "b".to_string()];
        let r = RecipientResolver::new(store).resolve(&c).await.unwrap();
        let phones: Vec<_> = r.iter().map(|r| r.phone_number.as_str()).collect();
        assert_eq!(phones, vec!["1", "5"]);
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let store = seeded().await;
        let mut c = sample_campaign("c1", "sub", 50);
        c.contact_groups = vec!["b".to_string(), "a".to_string()];
        let resolver = RecipientResolver::new(store);
        let first = resolver.resolve(&c).await.unwrap();
        let second = resolver.resolve(&c).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[tokio::test]
    async fn unknown_group_is_a_validation_error() {
        let store = seeded().await;
        let mut c = sample_campaign("c1", "sub", 50);
        c.contact_groups = vec!["a".to_string(), "ghost".to_string()];
        let err = RecipientResolver::new(store).resolve(&c).await.unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("ghost")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn everyone_opted_out_is_an_empty_audience() {
        let store = seeded().await;
        for p in ["2", "1"] {
            store.insert_opt_out(opt_out(p, "sub", OptOutScope::Owner)).await.unwrap();
        }
        let mut c = sample_campaign("c1", "sub", 50);
        c.contact_groups = vec!["b".to_string()];
        let err = RecipientResolver::new(store).resolve(&c).await.unwrap_err();
        assert!(matches!(err, Error::EmptyAudience(_)));
    }
}
