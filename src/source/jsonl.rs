use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::{IngestionSource, RawItem, SourceError, SourceQuery};

/// 1 行 1 JSON のファイルを読む取り込み元。
///
/// クエリが `*` か空なら全行、それ以外は行の生テキストに対する大文字小文字を無視した部分一致。
/// パースできない行は `Value::String` として渡し、正規化で不正扱いにさせる。
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn matches_query(line: &str, needle: Option<&str>) -> bool {
    needle.is_none_or(|needle| line.to_lowercase().contains(needle))
}

#[async_trait]
impl IngestionSource for JsonLinesSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<RawItem>, SourceError> {
        let file = File::open(&self.path).await.map_err(|error| {
            let message = format!("failed to open {}: {error}", self.path.display());
            if error.kind() == ErrorKind::NotFound {
                SourceError::Invalid(message)
            } else {
                SourceError::Unavailable(message)
            }
        })?;

        let trimmed = query.query.trim();
        let needle = (!trimmed.is_empty() && trimmed != "*").then(|| trimmed.to_lowercase());

        let mut lines = BufReader::new(file).lines();
        let mut items = Vec::new();
        let mut line_no = 0_usize;
        while items.len() < query.max_items {
            let Some(line) = lines.next_line().await.map_err(|error| {
                SourceError::Unavailable(format!("failed to read {}: {error}", self.path.display()))
            })?
            else {
                break;
            };
            line_no += 1;

            if line.trim().is_empty() || !matches_query(&line, needle.as_deref()) {
                continue;
            }
            let value = serde_json::from_str::<Value>(&line).unwrap_or_else(|error| {
                debug!(line = line_no, %error, "unparseable JSON line kept as raw string");
                Value::String(line.clone())
            });
            items.push(RawItem(value));
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        for line in lines {
            writeln!(file, "{line}").expect("write line");
        }
        file
    }

    #[tokio::test]
    async fn wildcard_reads_every_non_blank_line() {
        let file = write_lines(&[
            r#"{"id": "a", "text": "I love this!"}"#,
            "",
            r#"{"id": "b", "text": "terrible, worst ever"}"#,
        ]);
        let source = JsonLinesSource::new(file.path().to_path_buf());

        let items = source.fetch(&SourceQuery::new("*", 10)).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[1].0["id"], "b");
    }

    #[tokio::test]
    async fn query_filters_case_insensitively_and_respects_max() {
        let file = write_lines(&[
            r#"{"id": "1", "text": "Rust is great"}"#,
            r#"{"id": "2", "text": "python news"}"#,
            r#"{"id": "3", "text": "more RUST"}"#,
            r#"{"id": "4", "text": "rust again"}"#,
        ]);
        let source = JsonLinesSource::new(file.path().to_path_buf());

        let items = source.fetch(&SourceQuery::new("rust", 2)).await.unwrap();

        let ids: Vec<_> = items.iter().map(|item| item.0["id"].clone()).collect();
        assert_eq!(ids, vec![serde_json::json!("1"), serde_json::json!("3")]);
    }

    #[tokio::test]
    async fn unparseable_lines_become_raw_strings() {
        let file = write_lines(&["{not json", r#"{"id": "ok", "text": "fine"}"#]);
        let source = JsonLinesSource::new(file.path().to_path_buf());

        let items = source.fetch(&SourceQuery::new("", 10)).await.unwrap();

        assert_eq!(items[0].0, Value::String("{not json".to_string()));
        assert!(items[1].0.is_object());
    }

    #[tokio::test]
    async fn missing_file_is_invalid() {
        let source = JsonLinesSource::new(PathBuf::from("/nonexistent/tweets.jsonl"));
        let error = source.fetch(&SourceQuery::new("*", 10)).await.unwrap_err();
        assert!(matches!(error, SourceError::Invalid(_)));
    }
}
