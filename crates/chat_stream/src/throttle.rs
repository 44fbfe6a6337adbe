use chat_core::ThrottleConfig;
use tool_tracker::contains_marker_glyph;

/// Decides which fragments trigger a UI update.
///
/// Short replies update on every fragment. Once the reply is long, tiny
/// fragments are sampled; fragments that are long, start a paragraph or carry a
/// tool marker glyph always update. Sampling is counter based, so a given
/// fragment sequence always surfaces the same updates.
#[derive(Debug, Clone)]
pub struct UiThrottle {
    config: ThrottleConfig,
    tiny_seen: u32,
}

impl UiThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            tiny_seen: 0,
        }
    }

    /// `content_chars` is the length of the reply including `fragment`.
    pub fn should_surface(&mut self, content_chars: usize, fragment: &str) -> bool {
        if content_chars < self.config.short_content_chars {
            return true;
        }
        if fragment.chars().count() >= self.config.tiny_fragment_chars
            || fragment.contains("\n\n")
            || contains_marker_glyph(fragment)
        {
            return true;
        }

        self.tiny_seen = self.tiny_seen.wrapping_add(1);
        let every = if content_chars > self.config.long_content_chars {
            self.config.long_sample_every
        } else {
            self.config.medium_sample_every
        };
        self.tiny_seen % every.max(1) == 0
    }
}

impl Default for UiThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}
