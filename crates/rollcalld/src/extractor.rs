//! Feature extraction through an external program.
//!
//! The program is run as `<cmd> [args...] <image.png>` and must print a JSON
//! array with one descriptor (array of numbers) per detected face. Exit
//! status 75 (EX_TEMPFAIL) means its models are still loading.

use rollcall_core::collab::{ExtractError, FeatureExtractor};
use rollcall_core::{FeatureVector, Image};
use std::path::{Path, PathBuf};
use std::process::Command;

const EX_TEMPFAIL: i32 = 75;

pub struct CommandExtractor {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: Some(program.into()),
            args,
        }
    }

    /// Parse `ROLLCALL_EXTRACTOR_CMD` style input: program followed by
    /// whitespace-separated arguments. `None` leaves extraction unavailable.
    pub fn from_command_line(cmd: Option<&str>) -> Self {
        let mut parts = cmd.unwrap_or_default().split_whitespace().map(str::to_string);
        match parts.next() {
            Some(program) => Self::new(program, parts.collect()),
            None => {
                tracing::warn!("ROLLCALL_EXTRACTOR_CMD not set; recognition unavailable");
                Self {
                    program: None,
                    args: Vec::new(),
                }
            }
        }
    }
}

impl FeatureExtractor for CommandExtractor {
    fn detect_faces(&self, image: &Image) -> Result<Vec<FeatureVector>, ExtractError> {
        let Some(program) = &self.program else {
            return Err(ExtractError::NotReady);
        };
        if program.is_absolute() && !program.exists() {
            return Err(ExtractError::NotReady);
        }

        let png = std::env::temp_dir()
            .join(format!("rollcall-capture-{}.png", uuid::Uuid::new_v4()));
        write_png(image, &png)?;

        let output = Command::new(program).args(&self.args).arg(&png).output();
        let _ = std::fs::remove_file(&png);

        let output = output.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExtractError::NotReady,
            _ => ExtractError::Failed(format!("spawn {}: {e}", program.display())),
        })?;

        if output.status.code() == Some(EX_TEMPFAIL) {
            return Err(ExtractError::NotReady);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Failed(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let faces = parse_descriptors(&output.stdout)?;
        tracing::debug!(faces = faces.len(), "extractor finished");
        Ok(faces)
    }
}

/// Decode the extractor's stdout. All descriptors must share one non-zero length.
pub fn parse_descriptors(stdout: &[u8]) -> Result<Vec<FeatureVector>, ExtractError> {
    let raw: Vec<Vec<f32>> = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::Failed(format!("malformed extractor output: {e}")))?;

    if let Some(first) = raw.first() {
        let dim = first.len();
        if dim == 0 || raw.iter().any(|d| d.len() != dim) {
            return Err(ExtractError::Failed(
                "extractor returned descriptors of inconsistent length".into(),
            ));
        }
    }
    Ok(raw.into_iter().map(FeatureVector::new).collect())
}

fn write_png(image: &Image, path: &Path) -> Result<(), ExtractError> {
    let buffer = image::GrayImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| {
            ExtractError::Failed(format!(
                "image buffer holds {} bytes, expected {}x{}",
                image.pixels.len(),
                image.width,
                image.height
            ))
        })?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| ExtractError::Failed(format!("encode png: {e}")))
}

/// Load any supported image file as 8-bit grayscale.
pub fn load_grayscale(path: &Path) -> Result<Image, image::ImageError> {
    let luma = image::open(path)?.to_luma8();
    let (width, height) = luma.dimensions();
    Ok(Image {
        pixels: luma.into_raw(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Image {
        Image {
            pixels: (0..64).collect(),
            width: 8,
            height: 8,
        }
    }

    fn shell(script: &str) -> CommandExtractor {
        CommandExtractor::new("/bin/sh", vec!["-c".into(), script.into(), "extractor".into()])
    }

    #[test]
    fn test_unconfigured_is_not_ready() {
        let extractor = CommandExtractor::from_command_line(None);
        assert_eq!(extractor.detect_faces(&image()), Err(ExtractError::NotReady));
    }

    #[test]
    fn test_missing_program_is_not_ready() {
        let extractor =
            CommandExtractor::from_command_line(Some("/opt/rollcall/missing-extractor --fast"));
        assert_eq!(extractor.args, vec!["--fast".to_string()]);
        assert_eq!(extractor.detect_faces(&image()), Err(ExtractError::NotReady));
    }

    #[test]
    fn test_parse_descriptors() {
        let faces = parse_descriptors(b"[[0.1, 0.2], [0.3, 0.4]]").unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1].values(), &[0.3, 0.4]);

        assert!(parse_descriptors(b"[]").unwrap().is_empty());
        assert!(parse_descriptors(b"[[0.1], [0.2, 0.3]]").is_err());
        assert!(parse_descriptors(b"[[]]").is_err());
        assert!(parse_descriptors(b"faces: 2").is_err());
    }

    #[test]
    fn test_png_written_for_extractor_round_trips() {
        let path =
            std::env::temp_dir().join(format!("rollcall-test-{}.png", uuid::Uuid::new_v4()));
        write_png(&image(), &path).unwrap();

        let loaded = load_grayscale(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, image());
    }

    #[test]
    fn test_short_pixel_buffer_rejected() {
        let bad = Image {
            pixels: vec![0; 10],
            width: 8,
            height: 8,
        };
        let path = std::env::temp_dir().join("rollcall-never-written.png");
        assert!(matches!(write_png(&bad, &path), Err(ExtractError::Failed(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_program_with_image_path() {
        // $1 is the PNG path; prove it exists while the program runs.
        let extractor = shell(r#"test -f "$1" && echo '[[0.5, 0.25]]'"#);
        let faces = extractor.detect_faces(&image()).unwrap();
        assert_eq!(faces, vec![FeatureVector::new(vec![0.5, 0.25])]);
    }

    #[cfg(unix)]
    #[test]
    fn test_tempfail_exit_means_not_ready() {
        assert_eq!(shell("exit 75").detect_faces(&image()), Err(ExtractError::NotReady));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_failure() {
        let err = shell("echo 'model exploded' >&2; exit 3")
            .detect_faces(&image())
            .unwrap_err();
        match err {
            ExtractError::Failed(msg) => assert!(msg.contains("model exploded"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
