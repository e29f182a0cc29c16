use std::fmt;

use serde::{Deserialize, Serialize};

pub const NUM_EMOTIONS: usize = 7;

/// Label vocabulary in classifier output order.
pub const LABELS: [&str; NUM_EMOTIONS] = ["angry", "disgust", "fear", "happy", "neutral", "sad", "surprise"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; NUM_EMOTIONS] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    pub fn from_index(index: usize) -> Option<Emotion> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        LABELS[self.index()]
    }

    /// Facial cues a reader can look for in the highlighted regions.
    pub fn cues(self) -> &'static str {
        match self {
            Emotion::Angry => "Key indicators: furrowed brows, tight jaw, and narrowed eyes.",
            Emotion::Disgust => "Usually shown through a wrinkled nose and raised upper lip.",
            Emotion::Fear => "Typically identified by raised eyebrows and widened eyes.",
            Emotion::Happy => "Recognized through a smile and crinkled eyes.",
            Emotion::Neutral => "Characterized by relaxed facial muscles.",
            Emotion::Sad => "Often shown with downturned mouth and raised inner eyebrows.",
            Emotion::Surprise => "Identified by raised eyebrows and wide eyes.",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
