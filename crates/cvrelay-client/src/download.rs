use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ClientError;

/// Replace anything outside `[A-Za-z0-9_-]` so a task id is safe as a file
/// name component.
pub fn sanitize_task_id(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if out.is_empty() {
        out.push_str("task");
    }
    out
}

/// Last path segment of the result URL, query stripped.
fn original_name(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let path = without_scheme.split(['?', '#']).next().unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "output.bin".to_string()
    } else {
        name.to_string()
    }
}

/// Stream a result URL to `<dir>/<sanitized-task-id>-<original-name>`.
///
/// Refuses non-http(s) schemes and refuses to overwrite an existing file
/// unless `overwrite` is set. Returns the written path.
pub async fn download_to_dir(
    http: &wreq::Client,
    url: &str,
    dir: &Path,
    task_id: &str,
    overwrite: bool,
) -> Result<PathBuf, ClientError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ClientError::Download(format!(
            "refusing non-http(s) result URL: {url}"
        )));
    }

    let file_name = format!("{}-{}", sanitize_task_id(task_id), original_name(url));
    let target = dir.join(file_name);

    if target.exists() && !overwrite {
        return Err(ClientError::Download(format!(
            "{} already exists; pass overwrite to replace it",
            target.display()
        )));
    }

    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))?;
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(ClientError::Download(format!(
            "result URL answered HTTP {status}"
        )));
    }

    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::File::create(&target).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| ClientError::Transport(err.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!(
        event = "download_complete",
        url,
        path = %target.display(),
        bytes = written,
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_sanitized() {
        assert_eq!(sanitize_task_id("task-123_ok"), "task-123_ok");
        assert_eq!(sanitize_task_id("a/b\\c:d"), "a-b-c-d");
        assert_eq!(sanitize_task_id("..."), "---");
        assert_eq!(sanitize_task_id(""), "task");
    }

    #[test]
    fn original_names_come_from_the_url_path() {
        assert_eq!(
            original_name("https://cdn.example/videos/clip.mp4?sig=abc"),
            "clip.mp4"
        );
        assert_eq!(original_name("https://cdn.example/clip.mp4#frag"), "clip.mp4");
        assert_eq!(original_name("https://cdn.example/"), "output.bin");
        assert_eq!(original_name("https://cdn.example"), "output.bin");
    }
}
