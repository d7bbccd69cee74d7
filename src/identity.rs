//! Stable, human-meaningful names for execution instances.
//!
//! Runs spawned from templates or schedules each get a unique name, which
//! fragments grouping downstream. The normalized name collapses them back
//! onto the thing that produced them.

use crate::model::EntitySnapshot;

/// Label set on workflows submitted from a workflow template.
pub const TEMPLATE_LABEL: &str = "workflows.argoproj.io/workflow-template";

/// Label set on workflows spawned by a cron workflow.
pub const GENERATOR_LABEL: &str = "workflows.argoproj.io/cron-workflow";

/// Derive the grouping name for a snapshot. First match wins: template
/// label, generator label, generated-name prefix without its trailing `-`,
/// then the raw logical name.
pub fn normalize(snapshot: &EntitySnapshot) -> String {
    if let Some(name) = snapshot.labels.get(TEMPLATE_LABEL) {
        return name.clone();
    }
    if let Some(name) = snapshot.labels.get(GENERATOR_LABEL) {
        return name.clone();
    }
    if let Some(prefix) = snapshot.generate_name.as_deref().filter(|p| !p.is_empty()) {
        return prefix.strip_suffix('-').unwrap_or(prefix).to_string();
    }
    snapshot.logical_name.clone()
}
