use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::GemId;

/// Colour tags a persona may carry.
pub const COLOR_PALETTE: &[&str] = &[
    "fuchsia", "emerald", "sky", "amber", "indigo", "rose", "slate",
];

/// Starter prompts given to personas created without their own.
pub const DEFAULT_STARTER_PROMPTS: &[&str] = &["Hello!", "What can you do?", "Help me out."];

/// A persona: a named system instruction plus suggested openers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gem {
    pub id: GemId,
    pub name: String,
    pub description: String,
    pub icon: GemIcon,
    pub color: String,
    pub system_instruction: String,
    pub starter_prompts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GemIcon {
    Brain,
    Briefcase,
    Code,
    #[default]
    Sparkles,
    Book,
    Heart,
    Music,
}

impl std::str::FromStr for GemIcon {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brain" => Ok(GemIcon::Brain),
            "briefcase" => Ok(GemIcon::Briefcase),
            "code" => Ok(GemIcon::Code),
            "sparkles" => Ok(GemIcon::Sparkles),
            "book" => Ok(GemIcon::Book),
            "heart" => Ok(GemIcon::Heart),
            "music" => Ok(GemIcon::Music),
            other => Err(Error::Validation(format!("unknown icon '{other}'"))),
        }
    }
}

/// User-supplied fields for a new persona.
#[derive(Debug, Clone, Default)]
pub struct NewGem {
    pub name: String,
    pub description: String,
    pub system_instruction: String,
    pub icon: Option<GemIcon>,
    pub color: Option<String>,
}

impl NewGem {
    /// Validate the form and build a persona with a fresh `custom-` id.
    pub fn build(self) -> Result<Gem> {
        let name = required("name", &self.name)?;
        let description = required("description", &self.description)?;
        let system_instruction = required("system instruction", &self.system_instruction)?;

        let color = match self.color {
            Some(color) => {
                let color = color.trim().to_ascii_lowercase();
                if !COLOR_PALETTE.contains(&color.as_str()) {
                    return Err(Error::Validation(format!("unknown color '{color}'")));
                }
                color
            }
            None => "indigo".to_string(),
        };

        Ok(Gem {
            id: GemId::custom(),
            name,
            description,
            icon: self.icon.unwrap_or_default(),
            color,
            system_instruction,
            starter_prompts: DEFAULT_STARTER_PROMPTS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        })
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}
