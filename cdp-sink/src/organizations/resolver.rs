use cdp_common::time::now;
use serde_json::Value;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::domain::{email_domain, is_free_email_domain, normalize_domain};
use crate::db::organizations as repo;
use crate::error::{SinkError, SinkResult};
use crate::types::{
    Attributes, MemberOrganization, Organization, OrganizationFields, OrganizationIdentity,
    OrganizationIdentityType, OrganizationPayload,
};

/// Expand bare social handles into profile URLs
pub fn normalize_social_fields(fields: &mut OrganizationFields) {
    fn expand(slot: &mut Option<String>, prefix: &str) {
        if let Some(handle) = slot.as_deref().map(str::trim) {
            if !handle.is_empty() && !handle.contains('/') && !handle.contains('.') {
                *slot = Some(format!("{}{}", prefix, handle));
            }
        }
    }

    expand(&mut fields.linkedin, "linkedin.com/company/");
    expand(&mut fields.crunchbase, "crunchbase.com/organization/");
}

/// Domain identities normalized, empty values dropped, domains-first order
fn prepare_identities(identities: &[OrganizationIdentity]) -> Vec<OrganizationIdentity> {
    let mut prepared: Vec<OrganizationIdentity> = Vec::with_capacity(identities.len());

    for identity in identities {
        let value = if identity.identity_type.is_domain() {
            match normalize_domain(&identity.value) {
                Some(domain) => domain,
                None => continue,
            }
        } else {
            identity.value.trim().to_string()
        };
        if value.is_empty() {
            continue;
        }

        let candidate = OrganizationIdentity {
            value,
            ..identity.clone()
        };
        match prepared.iter_mut().find(|i| i.same_tuple(&candidate)) {
            Some(existing) => existing.verified |= candidate.verified,
            None => prepared.push(candidate),
        }
    }

    prepared.sort_by_key(|i| i.identity_type.lookup_rank());
    prepared
}

async fn find_by_identities(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    identities: &[OrganizationIdentity],
) -> SinkResult<Option<Uuid>> {
    for identity in identities.iter().filter(|i| i.verified) {
        let found = match identity.identity_type {
            OrganizationIdentityType::PrimaryDomain => {
                repo::find_by_verified_domain(conn, tenant_id, &identity.value).await?
            }
            _ => {
                repo::find_by_verified_identity(
                    conn,
                    tenant_id,
                    &identity.platform,
                    identity.identity_type,
                    &identity.value,
                )
                .await?
            }
        };
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Add missing platform values without touching existing ones
fn fill_missing_attributes(existing: &mut Attributes, incoming: &Attributes) -> bool {
    let mut changed = false;
    for (name, values) in incoming {
        match (existing.get_mut(name), values) {
            (Some(Value::Object(current)), Value::Object(values)) => {
                for (platform, value) in values {
                    if !current.contains_key(platform) && !value.is_null() {
                        current.insert(platform.clone(), value.clone());
                        changed = true;
                    }
                }
            }
            (None, values) if !values.is_null() => {
                existing.insert(name.clone(), values.clone());
                changed = true;
            }
            _ => {}
        }
    }
    changed
}

/// Attach incoming identities to an organization
///
/// Tuples already present only get their verified flag updated. A verified
/// tuple owned by another organization is stored unverified. An organization
/// keeps a single verified primary domain: another domain arriving as
/// primary becomes an alternative domain, and the same domain learned from
/// another platform is stored unverified.
async fn attach_identities(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    organization_id: Uuid,
    source: &str,
    identities: &[OrganizationIdentity],
) -> SinkResult<()> {
    let existing = repo::identities_for_organization(conn, organization_id).await?;
    let mut primary: Option<OrganizationIdentity> = existing
        .iter()
        .find(|e| e.verified && e.identity_type == OrganizationIdentityType::PrimaryDomain)
        .cloned();

    for incoming in identities {
        let mut identity = incoming.clone();
        let mut verified = identity.verified;

        if verified && identity.identity_type == OrganizationIdentityType::PrimaryDomain {
            if let Some(current) = primary.as_ref().filter(|p| !p.same_tuple(&identity)) {
                if current.value == identity.value {
                    verified = false;
                } else {
                    tracing::debug!(
                        organization_id = %organization_id,
                        primary_domain = %current.value,
                        domain = %identity.value,
                        "Organization already has a verified primary domain, storing as alternative"
                    );
                    identity.identity_type = OrganizationIdentityType::AlternativeDomain;
                }
            }
        }

        let owner = if verified {
            repo::find_by_verified_identity(
                conn,
                tenant_id,
                &identity.platform,
                identity.identity_type,
                &identity.value,
            )
            .await?
            .filter(|id| *id != organization_id)
        } else {
            None
        };

        if let Some(other) = owner {
            tracing::warn!(
                organization_id = %organization_id,
                other_organization_id = %other,
                identity_type = %identity.identity_type.as_str(),
                value = %identity.value,
                "Verified organization identity belongs to another organization, storing it unverified"
            );
            verified = false;
        }

        match existing.iter().find(|e| e.same_tuple(&identity)) {
            Some(current) if current.verified != verified => {
                repo::set_org_identity_verified(conn, organization_id, current, verified).await?;
            }
            Some(_) => {}
            None => {
                let row = OrganizationIdentity {
                    verified,
                    source: identity.source.clone().or_else(|| Some(source.to_string())),
                    ..identity.clone()
                };
                repo::insert_org_identity(conn, tenant_id, organization_id, &row).await?;
            }
        }

        if identity.identity_type == OrganizationIdentityType::PrimaryDomain {
            let is_current = primary.as_ref().is_some_and(|p| p.same_tuple(&identity));
            if verified && primary.is_none() {
                primary = Some(OrganizationIdentity {
                    verified,
                    ..identity.clone()
                });
            } else if !verified && is_current {
                primary = None;
            }
        }
    }

    Ok(())
}

async fn upsert(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    source: &str,
    payload: &OrganizationPayload,
    known: Option<Uuid>,
) -> SinkResult<Uuid> {
    let identities = prepare_identities(&payload.identities);
    if identities.is_empty() {
        return Err(SinkError::Validation(
            "Missing organization identity while creating/updating organization".to_string(),
        ));
    }

    let mut fields = payload.fields.clone();
    normalize_social_fields(&mut fields);

    let existing_id = match known {
        Some(id) => Some(id),
        None => find_by_identities(conn, tenant_id, &identities).await?,
    };

    let organization_id = match existing_id {
        Some(id) => {
            let mut organization = repo::find_organization(conn, id)
                .await?
                .ok_or_else(|| SinkError::NotFound(format!("organization {}", id)))?;

            let mut changed = organization.fields.fill_missing(&fields);
            changed |= fill_missing_attributes(&mut organization.attributes, &payload.attributes);
            if organization.display_name.trim().is_empty() {
                if let Some(name) = payload.display_name.as_ref().filter(|n| !n.trim().is_empty()) {
                    organization.display_name = name.clone();
                    changed = true;
                }
            }

            if changed {
                tracing::debug!(organization_id = %id, "Filling missing organization fields");
                repo::update_organization(conn, &organization).await?;
            }
            id
        }
        None => {
            let seed = identities
                .iter()
                .find(|i| i.verified)
                .unwrap_or(&identities[0]);
            let display_name = payload
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| seed.value.clone());

            let ts = now();
            let organization = Organization {
                id: Uuid::new_v4(),
                tenant_id,
                display_name,
                fields,
                attributes: payload.attributes.clone(),
                created_at: ts,
                updated_at: ts,
            };
            repo::insert_organization(conn, &organization).await?;
            tracing::info!(
                organization_id = %organization.id,
                display_name = %organization.display_name,
                "Created organization"
            );
            organization.id
        }
    };

    let source = payload.source.as_deref().unwrap_or(source);
    attach_identities(conn, tenant_id, organization_id, source, &identities).await?;

    Ok(organization_id)
}

/// Find an organization by its verified identities or create it
///
/// Identities are searched domains first. A match only receives fields it
/// is missing; nothing already set is overwritten.
pub async fn find_or_create(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    source: &str,
    payload: &OrganizationPayload,
) -> SinkResult<Uuid> {
    upsert(conn, tenant_id, source, payload, None).await
}

/// Organizations owning the verified primary domain of each e-mail
///
/// Lookup only: free-mail domains are ignored and nothing is created.
pub async fn assign_organization_by_email_domain(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    emails: &[String],
) -> SinkResult<Vec<Uuid>> {
    let mut domains: Vec<String> = Vec::new();
    for domain in emails.iter().filter_map(|e| email_domain(e)) {
        if !is_free_email_domain(&domain) && !domains.contains(&domain) {
            domains.push(domain);
        }
    }

    let mut organizations = Vec::new();
    for domain in &domains {
        if let Some(id) = repo::find_by_verified_domain(conn, tenant_id, domain).await? {
            if !organizations.contains(&id) {
                organizations.push(id);
            }
        }
    }

    if !organizations.is_empty() {
        tracing::debug!(count = organizations.len(), "Matched organizations by email domain");
    }
    Ok(organizations)
}

/// Link a member to organizations it has never been linked to
///
/// Returns how many links were created. Links removed in the past are not
/// recreated.
pub async fn add_to_member(
    conn: &mut SqliteConnection,
    member_id: Uuid,
    organization_ids: &[Uuid],
    source: &str,
) -> SinkResult<usize> {
    let mut added = 0;
    for organization_id in organization_ids {
        if repo::was_ever_linked(conn, member_id, *organization_id).await? {
            continue;
        }
        repo::insert_member_organization(
            conn,
            &MemberOrganization {
                id: Uuid::new_v4(),
                member_id,
                organization_id: *organization_id,
                title: None,
                date_start: None,
                date_end: None,
                source: Some(source.to_string()),
            },
        )
        .await?;
        added += 1;
    }
    Ok(added)
}

/// Fold enrichment data into an organization that already exists
///
/// The organization is located by its first identity. Returns `None` when
/// there is nothing to enrich.
pub async fn process_organization_enrich(
    conn: &mut SqliteConnection,
    tenant_id: Uuid,
    platform: &str,
    payload: &OrganizationPayload,
) -> SinkResult<Option<Uuid>> {
    let identities = prepare_identities(&payload.identities);
    let primary = payload.identities.first().and_then(|first| {
        identities
            .iter()
            .find(|i| i.platform == first.platform && i.identity_type == first.identity_type)
    });
    let Some(primary) = primary else {
        tracing::warn!("Organization can't be enriched, payload carries no usable identity");
        return Ok(None);
    };

    let by_value =
        repo::find_by_identity_value(conn, tenant_id, primary.identity_type, &primary.value).await?;
    let found = match by_value {
        Some(id) => Some(id),
        None if primary.identity_type.is_domain() => {
            repo::find_by_verified_domain(conn, tenant_id, &primary.value).await?
        }
        None => None,
    };

    match found {
        Some(organization_id) => {
            tracing::debug!(organization_id = %organization_id, "Enriching existing organization");
            upsert(conn, tenant_id, platform, payload, Some(organization_id)).await?;
            Ok(Some(organization_id))
        }
        None => {
            tracing::debug!("No organization found for enriching, payload had no effect");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_social_handles_are_expanded() {
        let mut fields = OrganizationFields {
            linkedin: Some("crowddotdev".into()),
            crunchbase: Some("crunchbase.com/organization/crowd".into()),
            ..Default::default()
        };
        normalize_social_fields(&mut fields);
        assert_eq!(fields.linkedin.as_deref(), Some("linkedin.com/company/crowddotdev"));
        assert_eq!(fields.crunchbase.as_deref(), Some("crunchbase.com/organization/crowd"));
    }

    #[test]
    fn test_prepare_identities_orders_domains_first() {
        let identities = vec![
            OrganizationIdentity {
                platform: "github".into(),
                identity_type: OrganizationIdentityType::Username,
                value: "crowd".into(),
                verified: true,
                source: None,
            },
            OrganizationIdentity::primary_domain("github", "https://www.Crowd.dev/", true),
            OrganizationIdentity::primary_domain("github", "crowd.dev", false),
        ];
        let prepared = prepare_identities(&identities);
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].value, "crowd.dev");
        assert!(prepared[0].verified);
        assert_eq!(prepared[1].identity_type, OrganizationIdentityType::Username);
    }

    #[test]
    fn test_fill_missing_attributes_keeps_existing() {
        let mut existing: Attributes = serde_json::from_value(serde_json::json!({
            "industry": { "github": "Software" }
        }))
        .unwrap();
        let incoming: Attributes = serde_json::from_value(serde_json::json!({
            "industry": { "github": "Hardware", "linkedin": "Software Development" },
            "size": { "linkedin": "11-50" }
        }))
        .unwrap();

        assert!(fill_missing_attributes(&mut existing, &incoming));
        assert_eq!(existing["industry"]["github"], "Software");
        assert_eq!(existing["industry"]["linkedin"], "Software Development");
        assert_eq!(existing["size"]["linkedin"], "11-50");
        assert!(!fill_missing_attributes(&mut existing, &incoming));
    }
}
