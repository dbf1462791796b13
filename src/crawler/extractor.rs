use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::browser::engine::PageHandle;
use crate::crawler::task::AttemptError;

/// Image that the site serves as a stand-in when no photo exists
const PLACEHOLDER_IMAGE: &str = "moto-bg.png";

const IMAGE_SELECTORS: [&str; 3] = [
    "img.left_column_top_model_image",
    "div.resumo_ficha img",
    "div.col-md-6 img",
];

/// Everything pulled out of one spec page
#[derive(Debug, Default, Clone, Serialize)]
pub struct PageData {
    pub url: String,
    pub page_title: String,
    pub meta_description: Option<String>,
    pub meta_keywords: Option<String>,
    pub canonical_url: Option<String>,
    /// Repaired JSON-LD blocks, bucketed by schema type
    pub structured_data: BTreeMap<String, Value>,
    pub image_url: Option<String>,
    pub key_specs_html: Option<String>,
    pub detailed_specs_html: Option<String>,
    pub faq_html: Option<String>,
}

/// Pulls structured page data out of a loaded page
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        page: &(dyn PageHandle + 'static),
        url: &str,
    ) -> Result<PageData, AttemptError>;
}

/// Extractor for the vehicle-spec page layout. Fetches the serialized page
/// once and does all parsing on the snapshot.
pub struct SpecExtractor {
    min_content_length: usize,
    /// Keep incomplete pages instead of rejecting them
    save_partial_data: bool,
    // The site emits JSON-LD with a recurring set of syntax defects.
    missing_type_value: Regex,
    trailing_comma_obj: Regex,
    trailing_comma_arr: Regex,
}

impl SpecExtractor {
    pub fn new(min_content_length: usize, save_partial_data: bool) -> Result<Self> {
        Ok(Self {
            min_content_length,
            save_partial_data,
            missing_type_value: Regex::new(r#""@type"\s*,"#)
                .context("invalid JSON-LD repair pattern")?,
            trailing_comma_obj: Regex::new(r",\s*\}").context("invalid JSON-LD repair pattern")?,
            trailing_comma_arr: Regex::new(r",\s*\]").context("invalid JSON-LD repair pattern")?,
        })
    }

    /// Fix the known defects in a raw JSON-LD block before parsing
    fn repair_jsonld(&self, raw: &str) -> String {
        let fixed = self
            .missing_type_value
            .replace_all(raw, r#""@type": "ListItem","#);
        let fixed = self.trailing_comma_obj.replace_all(&fixed, "}");
        let fixed = self.trailing_comma_arr.replace_all(&fixed, "]");
        fixed.replace("\\/", "/")
    }

    /// Bucket name for a JSON-LD block, from its root @type
    fn bucket_for(value: &Value) -> Option<&'static str> {
        let type_name = value.get("@type").and_then(Value::as_str)?;
        match type_name {
            "BreadcrumbList" => Some("breadcrumbs"),
            "FAQPage" => Some("faq"),
            "Motorcycle" | "Vehicle" | "Car" | "Product" => Some("vehicle"),
            _ => None,
        }
    }

    fn parse(&self, url: &str, html: &str) -> PageData {
        let doc = Html::parse_document(html);

        let mut data = PageData {
            url: url.to_string(),
            page_title: first_text(&doc, "h3.posts_title"),
            meta_description: meta_content(&doc, "meta[name=\"description\"]"),
            meta_keywords: meta_content(&doc, "meta[name=\"keywords\"]"),
            canonical_url: first_attr(&doc, "link[rel=\"canonical\"]", "href"),
            key_specs_html: fragment_html(&doc, "div.resumo_ficha"),
            detailed_specs_html: fragment_html(&doc, "div.ficha_specs_main"),
            faq_html: fragment_html(&doc, "div.faq_section, div#faq"),
            ..Default::default()
        };

        if let Ok(selector) = Selector::parse("script[type=\"application/ld+json\"]") {
            for script in doc.select(&selector) {
                let raw: String = script.text().collect();
                let repaired = self.repair_jsonld(&raw);
                match serde_json::from_str::<Value>(&repaired) {
                    Ok(value) => {
                        if let Some(bucket) = Self::bucket_for(&value) {
                            data.structured_data.insert(bucket.to_string(), value);
                        }
                    }
                    Err(e) => {
                        debug!(url, "Unparseable JSON-LD block after repair: {}", e);
                    }
                }
            }
        }

        for selector in IMAGE_SELECTORS {
            if let Some(src) = first_attr(&doc, selector, "src") {
                if src.contains(PLACEHOLDER_IMAGE) {
                    continue;
                }
                data.image_url = Some(src);
                break;
            }
        }

        data
    }

    /// Check the extracted data against the persistence policy. An empty
    /// list means the page is complete enough to save.
    pub fn validate(&self, data: &PageData) -> Vec<String> {
        let mut problems = Vec::new();

        if data.page_title.trim().is_empty() {
            problems.push("missing page title".to_string());
        }
        let specs_len = data
            .detailed_specs_html
            .as_deref()
            .map(str::len)
            .unwrap_or(0);
        if specs_len < self.min_content_length {
            problems.push(format!(
                "spec table too short ({} < {} chars)",
                specs_len, self.min_content_length
            ));
        }

        problems
    }
}

#[async_trait]
impl Extractor for SpecExtractor {
    async fn extract(
        &self,
        page: &(dyn PageHandle + 'static),
        url: &str,
    ) -> Result<PageData, AttemptError> {
        let html = page
            .content()
            .await
            .map_err(|e| AttemptError::Unexpected(format!("page snapshot failed: {e}")))?;

        let data = self.parse(url, &html);

        let problems = self.validate(&data);
        if !problems.is_empty() {
            if self.save_partial_data {
                warn!(url, problems = ?problems, "Keeping incomplete page data");
            } else {
                warn!(url, problems = ?problems, "Extracted data failed validation");
                return Err(AttemptError::ValidationFailed(problems.join("; ")));
            }
        }

        Ok(data)
    }
}

fn first_text(doc: &Html, selector: &str) -> String {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::to_string)
}

fn meta_content(doc: &Html, selector: &str) -> Option<String> {
    first_attr(doc, selector, "content").filter(|c| !c.trim().is_empty())
}

fn fragment_html(doc: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector).next().map(|el| el.html())
}
