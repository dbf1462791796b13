use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::crawler::extractor::PageData;
use crate::crawler::task::AttemptError;
use crate::storage::dedup::expected_artifact_path;

/// Persists extracted page data as an on-disk artifact
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactSaver: Send + Sync {
    async fn save(&self, data: &PageData) -> Result<PathBuf, AttemptError>;
}

/// Writes each page as a self-contained sectioned HTML document, at the
/// path the dedup index expects so reruns can find it.
pub struct HtmlSaver {
    root: PathBuf,
}

impl HtmlSaver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn render(data: &PageData) -> String {
        let mut doc = String::with_capacity(4096);

        doc.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        doc.push_str(&format!("<title>{}</title>\n", escape(&data.page_title)));
        if let Some(desc) = &data.meta_description {
            doc.push_str(&format!(
                "<meta name=\"description\" content=\"{}\">\n",
                escape_attr(desc)
            ));
        }
        if let Some(keywords) = &data.meta_keywords {
            doc.push_str(&format!(
                "<meta name=\"keywords\" content=\"{}\">\n",
                escape_attr(keywords)
            ));
        }
        if let Some(canonical) = &data.canonical_url {
            doc.push_str(&format!(
                "<link rel=\"canonical\" href=\"{}\">\n",
                escape_attr(canonical)
            ));
        }
        for value in data.structured_data.values() {
            doc.push_str("<script type=\"application/ld+json\">\n");
            doc.push_str(&value.to_string());
            doc.push_str("\n</script>\n");
        }
        doc.push_str("</head>\n<body>\n");

        doc.push_str(&format!(
            "<div id=\"page_title\"><h1>{}</h1></div>\n",
            escape(&data.page_title)
        ));
        if let Some(image) = &data.image_url {
            doc.push_str(&format!(
                "<div id=\"vehicle_image\"><img src=\"{}\"></div>\n",
                escape_attr(image)
            ));
        }
        if let Some(key) = &data.key_specs_html {
            doc.push_str(&format!("<div id=\"key_specs\">{key}</div>\n"));
        }
        if let Some(detailed) = &data.detailed_specs_html {
            doc.push_str(&format!("<div id=\"detailed_specs\">{detailed}</div>\n"));
        }
        if let Some(faq) = &data.faq_html {
            doc.push_str(&format!("<div id=\"faq_section\">{faq}</div>\n"));
        }
        doc.push_str(&format!(
            "<div id=\"crawl_meta\" data-source-url=\"{}\" data-crawled-at=\"{}\"></div>\n",
            escape_attr(&data.url),
            Utc::now().to_rfc3339()
        ));
        doc.push_str("</body>\n</html>\n");

        doc
    }
}

#[async_trait]
impl ArtifactSaver for HtmlSaver {
    async fn save(&self, data: &PageData) -> Result<PathBuf, AttemptError> {
        let path = expected_artifact_path(&data.url, &self.root).ok_or_else(|| {
            AttemptError::SaveFailed(format!("no artifact path for url: {}", data.url))
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AttemptError::SaveFailed(format!("create {}: {e}", parent.display()))
            })?;
        }

        let doc = Self::render(data);
        tokio::fs::write(&path, &doc)
            .await
            .map_err(|e| AttemptError::SaveFailed(format!("write {}: {e}", path.display())))?;

        debug!(bytes = doc.len(), path = %path.display(), "Artifact written");
        info!(url = %data.url, "Page saved");
        Ok(path)
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape(s).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PageData {
        PageData {
            url: "https://site.example/motorcycles-specs/acme/model-x".to_string(),
            page_title: "Acme Model X".to_string(),
            meta_description: Some("Specs & review".to_string()),
            canonical_url: Some("https://site.example/motorcycles-specs/acme/model-x".to_string()),
            structured_data: [("vehicle".to_string(), json!({"@type": "Motorcycle"}))]
                .into_iter()
                .collect(),
            image_url: Some("/cargallery/model-x.jpg".to_string()),
            detailed_specs_html: Some("<table><tr><td>Engine</td></tr></table>".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_artifact_at_the_dedup_path() {
        let dir = tempfile::tempdir().unwrap();
        let saver = HtmlSaver::new(dir.path().to_path_buf());

        let path = saver.save(&sample()).await.unwrap();
        assert_eq!(path, dir.path().join("acme").join("model-x.html"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("<div id=\"page_title\"><h1>Acme Model X</h1></div>"));
        assert!(contents.contains("<div id=\"detailed_specs\">"));
        assert!(contents.contains("application/ld+json"));
        assert!(contents.contains("Specs &amp; review"));
    }

    #[tokio::test]
    async fn unrecognized_urls_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let saver = HtmlSaver::new(dir.path().to_path_buf());

        let mut data = sample();
        data.url = "https://site.example/forum/thread-1".to_string();

        match saver.save(&data).await {
            Err(AttemptError::SaveFailed(msg)) => assert!(msg.contains("no artifact path")),
            other => panic!("expected SaveFailed, got {:?}", other),
        }
    }
}
