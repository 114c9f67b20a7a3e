//! Query structure as seen by the signature canonicaliser.
//!
//! A query is a set of [`Panel`]s. Each panel holds an ordered list of [`SubPanel`]s and each
//! sub-panel an ordered list of [`PanelItem`]s referencing a [`Concept`]. Only the concept ids and
//! their grouping matter here; inclusion flags, date filters and the like belong to the query
//! compiler and are not modelled.

use serde::{Deserialize, Serialize};

/// Opaque concept identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(String);

impl ConceptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelItem {
    pub concept: Concept,
}

impl PanelItem {
    pub fn for_concept(id: impl Into<String>) -> Self {
        Self {
            concept: Concept {
                id: ConceptId::new(id),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPanel {
    #[serde(default)]
    pub panel_items: Vec<PanelItem>,
}

impl SubPanel {
    /// Builds a sub-panel with one item per concept id, in the given order.
    pub fn of<I, S>(concept_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            panel_items: concept_ids.into_iter().map(PanelItem::for_concept).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    #[serde(default)]
    pub sub_panels: Vec<SubPanel>,
}

impl Panel {
    pub fn new(sub_panels: Vec<SubPanel>) -> Self {
        Self { sub_panels }
    }
}

/// Parses a query definition (a list of panels) from YAML or JSON text.
pub fn parse_panels(text: &str) -> crate::CohortResult<Vec<Panel>> {
    let deserializer = serde_yaml::Deserializer::from_str(text);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        crate::CohortError::ConfigParse {
            path: if path.is_empty() { "<root>".into() } else { path },
            message: err.into_inner().to_string(),
        }
    })
}
