//! Mention rendering for text coming from WhatsApp.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::Config;
use crate::types::WhatsAppID;

/// `@` followed by a phone number of at least five digits.
static MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([0-9]{5,})").expect("mention pattern is valid"));

pub struct Formatter {
    config: Arc<Config>,
}

impl Formatter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Replace `@<digits>` mentions with the Matrix ID of the matching
    /// puppet. Everything else is copied through unchanged.
    pub fn render_mentions(&self, text: &str) -> String {
        MENTION
            .replace_all(text, |caps: &Captures| {
                let jid = WhatsAppID::user(&caps[1]);
                self.config.puppet_mxid(&jid).to_string()
            })
            .into_owned()
    }
}
