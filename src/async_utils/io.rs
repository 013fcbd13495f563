//! I/O utilities.
//!
//! This module is responsible for reading flat JSON objects (our settings
//! format) and writing JSONL records, either to a file or to standard output.

use serde_json::Map;
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = Map<String, Value>;

/// Read a file containing a single, flat JSON object.
pub async fn read_json_object(path: &Path) -> Result<JsonObject> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("Failed to open file at path: {:?}", path))?;
    let mut data = String::new();
    // Read all at once because serde_json doesn't do async I/O.
    file.read_to_string(&mut data)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    match serde_json::from_str::<Value>(&data)
        .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))?
    {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "expected a JSON object in {:?}, found {}",
            path,
            json_type_name(&other)
        )),
    }
}

/// A short name for the type of a JSON value, for error messages.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Writes one JSON record per line to either standard output or a file.
pub struct JsonlWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>>,
}

impl JsonlWriter {
    /// Open a JSONL writer. `None` means standard output.
    pub async fn create(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(create_writer(path).await?),
        })
    }

    /// Write a single record, followed by a newline.
    pub async fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let json =
            serde_json::to_string(record).context("Failed to serialize JSON record")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
        // Records arrive slowly, so make each one visible as soon as it's done.
        self.writer.flush().await.context("Failed to flush output")
    }

    /// Flush any remaining output.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.flush().await.context("Failed to flush output")?;
        self.writer
            .shutdown()
            .await
            .context("Failed to close output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_json_object_rejects_non_objects() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("list.json");
        tokio::fs::write(&path, "[1, 2, 3]").await?;
        let err = read_json_object(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("an array"));
        Ok(())
    }

    #[tokio::test]
    async fn jsonl_writer_writes_one_record_per_line() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.jsonl");
        let mut writer = JsonlWriter::create(Some(&path)).await?;
        writer.write_record(&serde_json::json!({ "a": 1 })).await?;
        writer.write_record(&serde_json::json!({ "b": 2 })).await?;
        writer.finish().await?;
        let text = tokio::fs::read_to_string(&path).await?;
        assert_eq!(text, "{\"a\":1}\n{\"b\":2}\n");
        Ok(())
    }
}
