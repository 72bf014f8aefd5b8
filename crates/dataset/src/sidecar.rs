//! YOLO label sidecars: one `render_<id>.txt` next to each render.

use std::path::{Path, PathBuf};

use synthblend_core::annotation::YoloBox;

use crate::atomic::write_atomic;
use crate::error::DatasetError;

/// Sidecar path for a render image (`render_00003.png` -> `render_00003.txt`).
pub fn sidecar_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("txt")
}

/// Write one label per line, replacing any previous sidecar.
pub async fn write_yolo(path: &Path, labels: &[YoloBox]) -> Result<(), DatasetError> {
    let mut body = String::new();
    for label in labels {
        body.push_str(&label.to_string());
        body.push('\n');
    }
    write_atomic(path, body.as_bytes()).await?;
    tracing::debug!(path = %path.display(), labels = labels.len(), "Wrote YOLO sidecar");
    Ok(())
}

/// Read a sidecar back. Blank lines are ignored.
pub async fn read_yolo(path: &Path) -> Result<Vec<YoloBox>, DatasetError> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(DatasetError::io(path))?;
    body.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            l.parse::<YoloBox>().map_err(|e| DatasetError::InvalidLabel {
                path: path.to_path_buf(),
                line: i + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn sidecar_sits_next_to_image() {
        assert_eq!(
            sidecar_path(Path::new("/data/renders/render_00003.png")),
            PathBuf::from("/data/renders/render_00003.txt")
        );
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("render_00000.txt");
        let label = YoloBox {
            class_id: 2,
            center_x: 0.5,
            center_y: 0.25,
            width: 0.2,
            height: 0.1,
        };
        write_yolo(&path, &[label]).await.expect("write");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "2 0.500000 0.250000 0.200000 0.100000\n");
        assert_eq!(read_yolo(&path).await.expect("read"), vec![label]);
    }

    #[tokio::test]
    async fn bad_line_reports_its_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("render_00001.txt");
        std::fs::write(&path, "0 0.5 0.5 0.1 0.1\n\n0 1.5 0.5 0.1\n").unwrap();
        assert_matches!(
            read_yolo(&path).await,
            Err(DatasetError::InvalidLabel { line: 3, .. })
        );
    }
}
