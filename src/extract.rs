//! Tag-event extractor for Numista search result pages.
//!
//! Each result lives in a `<div class="...description_piece...">` block:
//! the coin id comes from the first anchor matching a known href shape, the
//! category from an `<em>` ("Coins › ..." prefix stripped), the KM number
//! from the block's accumulated plain text, and the title from the text of
//! the id anchor. The extractor is a single-pass state machine over generic
//! tag events, so it is independent of the tokenizer feeding it and never
//! fails on malformed markup; drift degrades to fewer candidates.

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;

/// Class marker that opens a result block.
const BLOCK_MARKER: &str = "description_piece";

/// Consecutive tokenizer errors tolerated before giving up on the rest of
/// the page. Partial results are still returned.
const MAX_ERROR_STREAK: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    Open { name: String, attrs: Vec<(String, String)> },
    Close { name: String },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub numista_id: i64,
    pub category: Option<String>,
    pub catalog_number: Option<i64>,
    pub title: Option<String>,
}

#[derive(Debug)]
pub struct ResultExtractor {
    anchor_html: Regex,
    anchor_bare: Regex,
    category_prefix: Regex,
    catalog_in_text: Regex,

    results: Vec<Candidate>,

    in_block: bool,
    block_depth: u32,
    block_text: String,
    current_id: Option<i64>,
    current_category: Option<String>,
    current_title: Option<String>,
    in_title_anchor: bool,
    title_text: String,
    in_emphasis: bool,
    emphasis_text: String,
}

impl ResultExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            anchor_html: Regex::new(r"/catalogue/pieces(\d+)\.html")
                .context("failed to compile html anchor regex")?,
            anchor_bare: Regex::new(r"^/(\d+)$")
                .context("failed to compile bare anchor regex")?,
            category_prefix: Regex::new(r"^Coins\s*[›>]\s*")
                .context("failed to compile category prefix regex")?,
            catalog_in_text: Regex::new(r"\bKM#\s*(\d+)")
                .context("failed to compile catalogue number regex")?,
            results: Vec::new(),
            in_block: false,
            block_depth: 0,
            block_text: String::new(),
            current_id: None,
            current_category: None,
            current_title: None,
            in_title_anchor: false,
            title_text: String::new(),
            in_emphasis: false,
            emphasis_text: String::new(),
        })
    }

    /// Advance the state machine by one event. Decisions use only the event
    /// plus carried state; there is no lookahead or backtracking.
    pub fn handle(&mut self, event: &TagEvent) {
        match event {
            TagEvent::Open { name, attrs } => self.handle_open(name, attrs),
            TagEvent::Close { name } => self.handle_close(name),
            TagEvent::Text(text) => self.handle_text(text),
        }
    }

    pub fn into_results(self) -> Vec<Candidate> {
        self.results
    }

    fn handle_open(&mut self, name: &str, attrs: &[(String, String)]) {
        if name == "div" {
            let class = attr_value(attrs, "class");
            if class.contains(BLOCK_MARKER) {
                // A new marker div restarts block state even when nested.
                self.in_block = true;
                self.block_depth = 1;
                self.block_text.clear();
                self.current_id = None;
                self.current_category = None;
                self.current_title = None;
                self.in_title_anchor = false;
                self.title_text.clear();
                return;
            }
            if self.in_block {
                self.block_depth += 1;
            }
        }

        if name == "a" && self.in_block && self.current_id.is_none() {
            let href = attr_value(attrs, "href");
            if let Some(id) = self.anchor_id(&href) {
                self.current_id = Some(id);
                self.in_title_anchor = true;
                self.title_text.clear();
            }
        }

        if name == "br" && self.in_title_anchor {
            self.title_text.push(' ');
        }

        if name == "em" && self.in_block {
            self.in_emphasis = true;
            self.emphasis_text.clear();
        }
    }

    fn handle_close(&mut self, name: &str) {
        if name == "a" && self.in_title_anchor {
            self.in_title_anchor = false;
            self.current_title = Some(collapse_whitespace(&self.title_text));
        }

        if name == "em" && self.in_emphasis {
            self.in_emphasis = false;
            let stripped = self
                .category_prefix
                .replace(self.emphasis_text.trim(), "")
                .trim()
                .to_string();
            if !stripped.is_empty() {
                self.current_category = Some(stripped);
            }
        }

        if name == "div" && self.in_block {
            self.block_depth = self.block_depth.saturating_sub(1);
            if self.block_depth == 0 {
                self.in_block = false;
                self.finish_block();
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        if self.in_emphasis {
            self.emphasis_text.push_str(text);
        }
        if self.in_title_anchor {
            self.title_text.push_str(text);
        }
        if self.in_block {
            self.block_text.push_str(text);
        }
    }

    fn finish_block(&mut self) {
        let Some(numista_id) = self.current_id.take() else {
            return;
        };

        // First occurrence of an id wins across the whole document.
        if self.results.iter().any(|hit| hit.numista_id == numista_id) {
            return;
        }

        let catalog_number = self
            .catalog_in_text
            .captures(&self.block_text)
            .and_then(|captures| captures.get(1))
            .and_then(|digits| digits.as_str().parse::<i64>().ok());

        self.results.push(Candidate {
            numista_id,
            category: self.current_category.take(),
            catalog_number,
            title: self.current_title.take(),
        });
    }

    fn anchor_id(&self, href: &str) -> Option<i64> {
        let captures = self
            .anchor_html
            .captures(href)
            .or_else(|| self.anchor_bare.captures(href))?;
        captures.get(1)?.as_str().parse::<i64>().ok()
    }
}

fn attr_value(attrs: &[(String, String)], key: &str) -> String {
    attrs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.clone())
        .unwrap_or_default()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokenize a fetched page and run it through the extractor.
///
/// quick-xml is run in a lenient configuration: end-tag names are not
/// checked, attributes use HTML rules, undecodable text falls back to a
/// lossy copy, and tokenizer errors skip forward rather than aborting. The
/// worst case for a mangled page is a partial or empty candidate list.
pub fn extract_candidates(html: &str) -> Result<Vec<Candidate>> {
    let mut extractor = ResultExtractor::new()?;

    let mut reader = Reader::from_str(html);
    reader.config_mut().check_end_names = false;

    let mut error_streak = 0_u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let (name, attrs) = tag_parts(e, &reader);
                extractor.handle(&TagEvent::Open { name, attrs });
            }
            Ok(Event::Empty(ref e)) => {
                let (name, attrs) = tag_parts(e, &reader);
                extractor.handle(&TagEvent::Open { name: name.clone(), attrs });
                extractor.handle(&TagEvent::Close { name });
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                extractor.handle(&TagEvent::Close { name });
            }
            Ok(Event::Text(ref t)) => {
                let text = match t.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(_) => String::from_utf8_lossy(t).into_owned(),
                };
                extractor.handle(&TagEvent::Text(text));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => {
                error_streak += 1;
                if error_streak > MAX_ERROR_STREAK {
                    break;
                }
                continue;
            }
        }
        error_streak = 0;
    }

    Ok(extractor.into_results())
}

fn tag_parts<R>(
    start: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<R>,
) -> (String, Vec<(String, String)>) {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_lowercase();

    let mut attrs = Vec::new();
    for attr in start.html_attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_lowercase();
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        attrs.push((key, value));
    }

    (name, attrs)
}
