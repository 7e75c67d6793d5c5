//! Per-channel settings directory with safe defaults.

use crate::config::PageConfig;
use relay_channels::ChannelId;
use std::collections::HashMap;

pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const DEFAULT_END_MESSAGE: &str =
    "Thank you for chatting with us today. We've reached the end of our conversation.";

#[derive(Debug, Clone)]
pub struct PageSettings {
    pub marker_text: String,
    pub greeting: String,
    pub max_turns: u32,
    pub end_message: String,
    pub assistant_id: String,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            marker_text: String::new(),
            greeting: String::new(),
            max_turns: DEFAULT_MAX_TURNS,
            end_message: DEFAULT_END_MESSAGE.to_string(),
            assistant_id: String::new(),
        }
    }
}

/// Read-only view over the configured pages. Unknown channels resolve to
/// defaults rather than an error, so a misrouted webhook event degrades to
/// "respond generically" instead of failing the turn.
#[derive(Debug, Default)]
pub struct PageDirectory {
    pages: HashMap<ChannelId, PageSettings>,
}

impl PageDirectory {
    pub fn from_config(pages: &[PageConfig]) -> Self {
        let pages = pages
            .iter()
            .map(|page| {
                (
                    ChannelId::new(page.channel_id.clone()),
                    PageSettings {
                        marker_text: page.marker_text.clone(),
                        greeting: page.greeting.clone(),
                        max_turns: page.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
                        end_message: page
                            .end_message
                            .clone()
                            .filter(|m| !m.trim().is_empty())
                            .unwrap_or_else(|| DEFAULT_END_MESSAGE.to_string()),
                        assistant_id: page.assistant_id.clone(),
                    },
                )
            })
            .collect();
        Self { pages }
    }

    pub fn settings_for(&self, channel_id: &ChannelId) -> PageSettings {
        match self.pages.get(channel_id) {
            Some(settings) => settings.clone(),
            None => {
                tracing::warn!(%channel_id, "no settings for channel; using defaults");
                PageSettings::default()
            }
        }
    }

    pub fn access_tokens(pages: &[PageConfig]) -> HashMap<ChannelId, String> {
        pages
            .iter()
            .map(|page| {
                (
                    ChannelId::new(page.channel_id.clone()),
                    page.access_token.clone(),
                )
            })
            .collect()
    }
}
