//! CMS table conventions: content types, their link tables and the
//! polymorphic file attachment table.
use anyhow::{bail, Result};
use chrono::NaiveDateTime;

/// Polymorphic upload attachments keyed by `(related_id, related_type)`.
pub const MORPH_TABLE: &str = "files_related_mph";

/// Junction table owned by a content table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTable {
    pub table: &'static str,
    /// Column that points back at the owning content row.
    pub owner_column: &'static str,
    pub target_column: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub table: String,
    /// `related_type` value used in the morph table.
    pub uid: String,
    pub links: Vec<LinkTable>,
}

pub const STAGE_LINK: LinkTable = LinkTable {
    table: "tmbaccommodations_stage_lnk",
    owner_column: "tmbaccommodation_id",
    target_column: "tmb_stage_id",
};

const REGISTRY: &[(&str, &str, &[LinkTable])] = &[
    (
        "tmbaccommodations",
        "api::tmbaccommodation.tmbaccommodation",
        &[
            STAGE_LINK,
            LinkTable {
                table: "tmbaccommodations_cmps",
                owner_column: "entity_id",
                target_column: "cmp_id",
            },
        ],
    ),
    (
        "tmb_stages",
        "api::tmb-stage.tmb-stage",
        &[LinkTable {
            table: "tmbaccommodations_stage_lnk",
            owner_column: "tmb_stage_id",
            target_column: "tmbaccommodation_id",
        }],
    ),
    (
        "hikes",
        "api::hike.hike",
        &[
            LinkTable {
                table: "countries_hikes_lnk",
                owner_column: "hike_id",
                target_column: "country_id",
            },
            LinkTable {
                table: "hikes_sceneries_lnk",
                owner_column: "hike_id",
                target_column: "scenery_id",
            },
            LinkTable {
                table: "hikes_months_lnk",
                owner_column: "hike_id",
                target_column: "month_id",
            },
            LinkTable {
                table: "accommodations_hikes_lnk",
                owner_column: "hike_id",
                target_column: "accommodation_id",
            },
            LinkTable {
                table: "hikes_cmps",
                owner_column: "entity_id",
                target_column: "cmp_id",
            },
        ],
    ),
    (
        "accommodations",
        "api::accommodation.accommodation",
        &[LinkTable {
            table: "accommodations_hikes_lnk",
            owner_column: "accommodation_id",
            target_column: "hike_id",
        }],
    ),
];

impl ContentType {
    pub fn lookup(table: &str) -> Option<ContentType> {
        REGISTRY
            .iter()
            .find(|(name, _, _)| *name == table)
            .map(|(name, uid, links)| ContentType {
                table: (*name).to_string(),
                uid: (*uid).to_string(),
                links: links.to_vec(),
            })
    }

    /// Registry entry, or a bare descriptor without link tables for tables
    /// the registry does not know about.
    pub fn resolve(table: &str) -> Result<ContentType> {
        validate_ident(table)?;
        if let Some(ct) = Self::lookup(table) {
            return Ok(ct);
        }
        let singular = table.strip_suffix('s').unwrap_or(table);
        Ok(ContentType {
            table: table.to_string(),
            uid: format!("api::{singular}.{singular}"),
            links: Vec::new(),
        })
    }

    pub fn known_tables() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(name, _, _)| *name)
    }
}

/// Draft rows have no `published_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Draft,
    Published,
}

impl Variant {
    pub fn of(published_at: Option<NaiveDateTime>) -> Self {
        if published_at.is_some() {
            Variant::Published
        } else {
            Variant::Draft
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Variant::Draft => "DRAFT",
            Variant::Published => "PUBLISHED",
        }
    }
}

pub fn validate_ident(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !ok || name.len() > 63 {
        bail!("refusing to use `{name}` as an SQL identifier");
    }
    Ok(())
}

/// Validated, double-quoted identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_ident(name)?;
    Ok(format!("\"{name}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let ct = ContentType::lookup("tmbaccommodations").unwrap();
        assert_eq!(ct.uid, "api::tmbaccommodation.tmbaccommodation");
        assert_eq!(ct.links[0], STAGE_LINK);
        assert!(ContentType::lookup("nope").is_none());
    }

    #[test]
    fn resolve_unknown_table() {
        let ct = ContentType::resolve("trails").unwrap();
        assert_eq!(ct.uid, "api::trail.trail");
        assert!(ct.links.is_empty());
        assert!(ContentType::resolve("trails; drop table x").is_err());
    }

    #[test]
    fn quoting_rejects_injection() {
        assert_eq!(quote_ident("tmb_stages").unwrap(), "\"tmb_stages\"");
        assert!(quote_ident("").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("a\"b").is_err());
        assert!(quote_ident("a b").is_err());
        assert!(quote_ident(&"x".repeat(64)).is_err());
    }

    #[test]
    fn variant_from_published_at() {
        let ts = chrono::NaiveDate::from_ymd_opt(2025, 11, 6)
            .unwrap()
            .and_hms_opt(22, 24, 31)
            .unwrap();
        assert_eq!(Variant::of(Some(ts)), Variant::Published);
        assert_eq!(Variant::of(None).label(), "DRAFT");
    }

    #[test]
    fn every_registered_link_is_quotable() {
        for table in ContentType::known_tables() {
            let ct = ContentType::lookup(table).unwrap();
            for link in ct.links {
                quote_ident(link.table).unwrap();
                quote_ident(link.owner_column).unwrap();
                quote_ident(link.target_column).unwrap();
            }
        }
    }
}
