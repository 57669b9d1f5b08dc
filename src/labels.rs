//! Label → category lookup built once from configuration.
//!
//! Classifier labels are free strings; everything downstream reasons in terms
//! of `LabelCategory`, so membership is resolved here and nowhere else.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::{ClassificationResult, SourceKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum LabelCategory {
    Focus,
    Distraction,
    Absence,
    /// Votes neutral; counted by the ergonomic alert rule alongside absence.
    Fatigue,
    Neutral,
}

/// The category a single sample votes for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SampleVote {
    Focus,
    Distraction,
    Absence,
    Neutral,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CategorySets {
    pub focus: Vec<String>,
    pub distraction: Vec<String>,
    pub absence: Vec<String>,
    pub fatigue: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Category membership for both label spaces. Labels not listed are neutral.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelConfig {
    pub camera: CategorySets,
    /// Only the focus and distraction sets take part in voting for the screen.
    pub screen: CategorySets,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            camera: CategorySets {
                focus: strings(&["Focused", "LookingAtScreen", "Typing", "Reading"]),
                distraction: strings(&["HeadAway", "EyesOffScreen", "PhoneLikely", "Talking", "Eating"]),
                absence: strings(&["NoFace", "EmptyChair", "Away"]),
                fatigue: strings(&["Yawning", "EyesClosed", "HeadDown"]),
            },
            screen: CategorySets {
                focus: strings(&["Code", "Terminal", "Documentation", "Document", "Spreadsheet", "Design"]),
                distraction: strings(&["SocialMedia", "Video", "Game", "Shopping", "News", "Chat"]),
                absence: Vec::new(),
                fatigue: Vec::new(),
            },
        }
    }
}

fn build_table(space: &str, sets: &CategorySets) -> Result<HashMap<String, LabelCategory>> {
    let mut table = HashMap::new();
    let groups = [
        (LabelCategory::Focus, &sets.focus),
        (LabelCategory::Distraction, &sets.distraction),
        (LabelCategory::Absence, &sets.absence),
        (LabelCategory::Fatigue, &sets.fatigue),
    ];
    for (category, labels) in groups {
        for label in labels {
            if let Some(previous) = table.insert(label.clone(), category) {
                if previous != category {
                    bail!("{space} label '{label}' is listed as both {previous:?} and {category:?}");
                }
            }
        }
    }
    Ok(table)
}

#[derive(Debug, Clone)]
pub struct LabelCatalog {
    camera: HashMap<String, LabelCategory>,
    screen: HashMap<String, LabelCategory>,
}

impl LabelCatalog {
    pub fn from_config(config: &LabelConfig) -> Result<Self> {
        Ok(Self {
            camera: build_table("camera", &config.camera)?,
            screen: build_table("screen", &config.screen)?,
        })
    }

    pub fn category(&self, kind: SourceKind, label: &str) -> LabelCategory {
        let table = match kind {
            SourceKind::Camera => &self.camera,
            SourceKind::Screen => &self.screen,
        };
        table.get(label).copied().unwrap_or(LabelCategory::Neutral)
    }

    /// Category of a label from either space, camera first. Used where the
    /// originating source is no longer known (merged reconciliation maps).
    pub fn category_any(&self, label: &str) -> LabelCategory {
        self.camera
            .get(label)
            .or_else(|| self.screen.get(label))
            .copied()
            .unwrap_or(LabelCategory::Neutral)
    }

    /// Vote cast by one sample, from the primary label of each source.
    ///
    /// Absence wins outright; a camera distraction overrides a focused screen;
    /// focus needs a focused camera and a focused or missing screen.
    pub fn vote(&self, result: &ClassificationResult) -> SampleVote {
        let camera = result
            .camera_primary()
            .map(|label| self.category(SourceKind::Camera, label))
            .unwrap_or(LabelCategory::Neutral);
        let screen = result
            .screen_primary()
            .map(|label| self.category(SourceKind::Screen, label));

        if camera == LabelCategory::Absence {
            return SampleVote::Absence;
        }
        if camera == LabelCategory::Distraction || screen == Some(LabelCategory::Distraction) {
            return SampleVote::Distraction;
        }
        if camera == LabelCategory::Focus
            && matches!(screen, None | Some(LabelCategory::Focus))
        {
            return SampleVote::Focus;
        }
        SampleVote::Neutral
    }

    /// Camera primary is in the absence or fatigue set.
    pub fn is_absence_or_fatigue(&self, result: &ClassificationResult) -> bool {
        result
            .camera_primary()
            .map(|label| {
                matches!(
                    self.category(SourceKind::Camera, label),
                    LabelCategory::Absence | LabelCategory::Fatigue
                )
            })
            .unwrap_or(false)
    }
}
