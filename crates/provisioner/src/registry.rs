//! Template resolution.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::label::LabelExpr;
use crate::template::AgentTemplate;

#[derive(Debug)]
struct Entry {
    labels: BTreeSet<String>,
    template: Arc<AgentTemplate>,
}

/// Ordered, read-only set of templates for one cloud.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    entries: Vec<Entry>,
}

impl TemplateRegistry {
    /// Registry over `templates`, keeping their order.
    #[must_use]
    pub fn new(templates: impl IntoIterator<Item = AgentTemplate>) -> Self {
        Self {
            entries: templates
                .into_iter()
                .map(|template| Entry {
                    labels: template.label_set(),
                    template: Arc::new(template),
                })
                .collect(),
        }
    }

    /// First template whose labels satisfy `label`; any template when no
    /// label was requested.
    #[must_use]
    pub fn find_template(&self, label: Option<&LabelExpr>) -> Option<Arc<AgentTemplate>> {
        self.entries
            .iter()
            .find(|entry| label.is_none_or(|expr| expr.matches(&entry.labels)))
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Template by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<AgentTemplate>> {
        self.entries
            .iter()
            .find(|entry| entry.template.name == name)
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Template names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.template.name.as_str())
    }

    /// Templates in order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentTemplate> {
        self.entries.iter().map(|entry| entry.template.as_ref())
    }

    /// Number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no templates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
