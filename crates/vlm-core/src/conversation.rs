//! Bounded multi-modal conversation state.
//!
//! A [`ConversationStore`] owns every turn of one session together with the
//! media resources those turns hold. Whenever a turn leaves the store (length
//! overflow, media replacement, `clear`, or drop) its image raster is freed and
//! its transcoded audio file is deleted before the turn itself is discarded.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::media::{AudioAsset, ImageAsset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Role name in the Gemma turn grammar.
    pub fn as_prompt_role(self) -> &'static str {
        match self {
            Self::Assistant => "model",
            Self::User => "user",
        }
    }
}

/// A single piece of turn content.
#[derive(Debug)]
pub enum ContentItem {
    Text(String),
    Image(ImageAsset),
    Audio(AudioAsset),
}

impl ContentItem {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    pub fn is_media(&self) -> bool {
        !matches!(self, Self::Text(_))
    }

    pub fn describe(&self) -> ContentDescriptor {
        match self {
            Self::Text(body) => ContentDescriptor::Text { text: body.clone() },
            Self::Image(image) => ContentDescriptor::Image {
                width: image.width(),
                height: image.height(),
            },
            Self::Audio(audio) => ContentDescriptor::Audio {
                size_bytes: audio.size_bytes(),
            },
        }
    }

    fn release(self) {
        match self {
            Self::Text(_) => {}
            Self::Image(image) => image.release(),
            Self::Audio(audio) => audio.release(),
        }
    }
}

#[derive(Debug)]
pub struct Turn {
    pub role: ChatRole,
    pub content: Vec<ContentItem>,
    pub timestamp: SystemTime,
}

impl Turn {
    pub fn new(role: ChatRole, content: Vec<ContentItem>) -> Self {
        Self {
            role,
            content,
            timestamp: SystemTime::now(),
        }
    }

    /// Concatenation of the text items, in order. Media contributes nothing.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text(body) => Some(body.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_media(&self) -> bool {
        self.content.iter().any(ContentItem::is_media)
    }

    fn release(self) {
        for item in self.content {
            item.release();
        }
    }
}

/// Media-free view of a content item, as reported by history endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentDescriptor {
    Text { text: String },
    Image { width: u32, height: u32 },
    Audio { size_bytes: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnSnapshot {
    pub role: ChatRole,
    pub content: Vec<ContentDescriptor>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Newest image and newest audio across the conversation.
#[derive(Debug, Clone, Default)]
pub struct ActiveMedia {
    pub image: Option<Arc<RgbImage>>,
    pub audio: Option<PathBuf>,
}

impl ActiveMedia {
    pub fn num_images(&self) -> usize {
        usize::from(self.image.is_some())
    }

    pub fn num_audios(&self) -> usize {
        usize::from(self.audio.is_some())
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[derive(Debug)]
pub struct ConversationStore {
    turns: VecDeque<Turn>,
    max_length: usize,
}

impl ConversationStore {
    pub fn new(max_length: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_length: max_length.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Append a text-only turn. With `clear_media` on a user turn, every
    /// media-bearing turn is dropped first.
    pub fn append_text(&mut self, role: ChatRole, text: impl Into<String>, clear_media: bool) {
        if clear_media && role == ChatRole::User {
            self.evict_media_turns();
        }
        self.push(Turn::new(role, vec![ContentItem::Text(text.into())]));
    }

    /// Append a turn that may carry text, an image and/or audio.
    pub fn append_media(&mut self, role: ChatRole, content: Vec<ContentItem>, replace_media: bool) {
        if replace_media {
            self.evict_media_turns();
        }
        self.push(Turn::new(role, content));
    }

    /// Remove every turn holding an image or audio item, wherever it sits.
    /// Returns the number of turns removed.
    pub fn evict_media_turns(&mut self) -> usize {
        let before = self.turns.len();
        let (media, kept): (VecDeque<Turn>, VecDeque<Turn>) =
            std::mem::take(&mut self.turns)
                .into_iter()
                .partition(Turn::has_media);
        self.turns = kept;
        for turn in media {
            turn.release();
        }

        let removed = before - self.turns.len();
        if removed > 0 {
            debug!("Evicted {removed} media turn(s)");
        }
        removed
    }

    /// Drop all turns, releasing their media. Safe to call repeatedly.
    pub fn clear(&mut self) {
        let count = self.turns.len();
        while let Some(turn) = self.turns.pop_front() {
            turn.release();
        }
        if count > 0 {
            debug!("Cleared {count} turn(s)");
        }
    }

    pub fn most_recent_active_media(&self) -> ActiveMedia {
        let mut active = ActiveMedia::default();
        for turn in self.turns.iter().rev() {
            for item in &turn.content {
                match item {
                    ContentItem::Image(image) if active.image.is_none() => {
                        active.image = Some(Arc::clone(image.raster()));
                    }
                    ContentItem::Audio(audio) if active.audio.is_none() => {
                        active.audio = Some(audio.path().to_path_buf());
                    }
                    _ => {}
                }
            }
            if active.image.is_some() && active.audio.is_some() {
                break;
            }
        }
        active
    }

    pub fn history(&self) -> Vec<TurnSnapshot> {
        self.turns
            .iter()
            .map(|turn| TurnSnapshot {
                role: turn.role,
                content: turn.content.iter().map(ContentItem::describe).collect(),
                timestamp: turn
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_length {
            if let Some(oldest) = self.turns.pop_front() {
                oldest.release();
            }
        }
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        self.clear();
    }
}
