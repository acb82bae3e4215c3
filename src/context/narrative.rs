use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::{join, join_all};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CHARACTER_HEADER: &str = "--- Character Information (for context) ---\n";
const PLOT_POINT_HEADER: &str = "--- Plot Point Information (for context) ---\n";
const SECTION_FOOTER: &str = "\n-----------------------------------------\n\n";

/// A character record from the project store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub traits: Option<String>,
    #[serde(default)]
    pub motivations: Option<String>,
    #[serde(default)]
    pub physical_appearance: Option<String>,
    #[serde(default = "default_character_status")]
    pub status: String,
}

fn default_character_status() -> String {
    "Alive".to_string()
}

impl Character {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            traits: None,
            motivations: None,
            physical_appearance: None,
            status: default_character_status(),
        }
    }

    /// One descriptor line: `Name: ..., Description: ...[, Traits: ...]...`.
    pub fn descriptor(&self) -> String {
        let mut line = format!("Name: {}", self.name);
        push_field(&mut line, "Description", Some(&self.description));
        push_field(&mut line, "Traits", self.traits.as_deref());
        push_field(&mut line, "Motivations", self.motivations.as_deref());
        push_field(&mut line, "Appearance", self.physical_appearance.as_deref());
        push_field(&mut line, "Status", Some(&self.status));
        line
    }
}

/// A plot point record from the project store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_plot_status")]
    pub status: String,
    #[serde(rename = "type", default = "default_plot_type")]
    pub plot_type: Option<String>,
}

fn default_plot_status() -> String {
    "Planned".to_string()
}

fn default_plot_type() -> Option<String> {
    Some("Major Plot Beat".to_string())
}

impl PlotPoint {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: default_plot_status(),
            plot_type: default_plot_type(),
        }
    }

    /// One descriptor line. The status is only mentioned once it moves past "Planned".
    pub fn descriptor(&self) -> String {
        let mut line = format!("Plot Point: {}", self.title);
        push_field(&mut line, "Description", Some(&self.description));
        push_field(&mut line, "Type", self.plot_type.as_deref());
        if self.status != "Planned" {
            push_field(&mut line, "Status", Some(&self.status));
        }
        line
    }
}

fn push_field(line: &mut String, label: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        line.push_str(", ");
        line.push_str(label);
        line.push_str(": ");
        line.push_str(value);
    }
}

fn render_section(header: &str, lines: Vec<String>) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut block = String::from(header);
    block.push_str(&lines.join("\n"));
    block.push_str(SECTION_FOOTER);
    block
}

/// Character block in selection order; empty when nothing is selected.
pub fn render_characters(characters: &[Character]) -> String {
    render_section(
        CHARACTER_HEADER,
        characters.iter().map(Character::descriptor).collect(),
    )
}

/// Plot point block in selection order; empty when nothing is selected.
pub fn render_plot_points(plot_points: &[PlotPoint]) -> String {
    render_section(
        PLOT_POINT_HEADER,
        plot_points.iter().map(PlotPoint::descriptor).collect(),
    )
}

/// Read access to the project's characters and plot points.
#[async_trait]
pub trait NarrativeSource: Send + Sync {
    async fn character(&self, id: Uuid) -> Option<Character>;
    async fn plot_point(&self, id: Uuid) -> Option<PlotPoint>;
}

/// Narrative elements resolved for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub characters: Vec<Character>,
    pub plot_points: Vec<PlotPoint>,
}

impl Selection {
    /// Look up the selected IDs, keeping selection order. Unknown IDs are skipped.
    pub async fn resolve(
        source: &dyn NarrativeSource,
        character_ids: &[Uuid],
        plot_point_ids: &[Uuid],
    ) -> Self {
        let (characters, plot_points) = join(
            join_all(character_ids.iter().map(|id| source.character(*id))),
            join_all(plot_point_ids.iter().map(|id| source.plot_point(*id))),
        )
        .await;

        let mut selection = Selection::default();
        for (id, found) in character_ids.iter().zip(characters) {
            match found {
                Some(character) => selection.characters.push(character),
                None => tracing::debug!(%id, "selected character not found; skipping"),
            }
        }
        for (id, found) in plot_point_ids.iter().zip(plot_points) {
            match found {
                Some(plot_point) => selection.plot_points.push(plot_point),
                None => tracing::debug!(%id, "selected plot point not found; skipping"),
            }
        }
        selection
    }

    pub fn descriptor_text(&self) -> String {
        let mut text = render_characters(&self.characters);
        text.push_str(&render_plot_points(&self.plot_points));
        text
    }
}

/// A project held in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryProject {
    characters: RwLock<HashMap<Uuid, Character>>,
    plot_points: RwLock<HashMap<Uuid, PlotPoint>>,
}

impl InMemoryProject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_character(&self, character: Character) -> Uuid {
        let id = character.id;
        self.characters.write().insert(id, character);
        id
    }

    pub fn add_plot_point(&self, plot_point: PlotPoint) -> Uuid {
        let id = plot_point.id;
        self.plot_points.write().insert(id, plot_point);
        id
    }

    pub fn remove_character(&self, id: Uuid) -> Option<Character> {
        self.characters.write().remove(&id)
    }

    pub fn remove_plot_point(&self, id: Uuid) -> Option<PlotPoint> {
        self.plot_points.write().remove(&id)
    }
}

#[async_trait]
impl NarrativeSource for InMemoryProject {
    async fn character(&self, id: Uuid) -> Option<Character> {
        self.characters.read().get(&id).cloned()
    }

    async fn plot_point(&self, id: Uuid) -> Option<PlotPoint> {
        self.plot_points.read().get(&id).cloned()
    }
}
