//! Image vs. generic file classification. Pure name matching, no content sniffing.

use regex::Regex;
use std::path::Path;

/// Colour/interlace model handed to the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interlace {
    Jpeg,
    Png,
}

impl Interlace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interlace::Jpeg => "JPEG",
            Interlace::Png => "PNG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image(Interlace),
    Generic,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    image: Option<Regex>,
}

impl Classifier {
    /// `prefixes` empty or starting with `*` means every file name qualifies.
    pub fn new(extensions: &[String], prefixes: &[String]) -> Result<Self, regex::Error> {
        let extensions: Vec<String> = extensions
            .iter()
            .map(|e| e.trim_start_matches('.'))
            .filter(|e| !e.is_empty())
            .map(regex::escape)
            .collect();
        if extensions.is_empty() {
            return Ok(Self { image: None });
        }

        let prefix = match prefixes.first() {
            None => String::new(),
            Some(first) if first == "*" => String::new(),
            Some(_) => {
                let alternatives: Vec<String> = prefixes
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| regex::escape(p))
                    .collect();
                format!("(?:{})", alternatives.join("|"))
            }
        };

        let pattern = format!(r"(?s)^{}.*\.(?i:{})$", prefix, extensions.join("|"));
        Ok(Self {
            image: Some(Regex::new(&pattern)?),
        })
    }

    pub fn classify(&self, path: &Path) -> FileKind {
        let Some(image) = &self.image else {
            return FileKind::Generic;
        };
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return FileKind::Generic;
        };
        if !image.is_match(&name) {
            return FileKind::Generic;
        }

        let is_jpeg = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false);
        FileKind::Image(if is_jpeg { Interlace::Jpeg } else { Interlace::Png })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let classifier = Classifier::new(&strings(&["jpg", "JPEG", "png", "pdf"]), &[]).unwrap();
        assert_eq!(
            classifier.classify(Path::new("/src/a/photo.JPG")),
            FileKind::Image(Interlace::Jpeg)
        );
        assert_eq!(
            classifier.classify(Path::new("/src/a/scan.Pdf")),
            FileKind::Image(Interlace::Png)
        );
        assert_eq!(
            classifier.classify(Path::new("/src/a/notes.txt")),
            FileKind::Generic
        );
    }

    #[test]
    fn test_extension_must_be_final() {
        let classifier = Classifier::new(&strings(&["jpg"]), &strings(&["*"])).unwrap();
        assert_eq!(
            classifier.classify(Path::new("/src/photo.jpg.txt")),
            FileKind::Generic
        );
        assert_eq!(classifier.classify(Path::new("/src/jpg")), FileKind::Generic);
    }

    #[test]
    fn test_prefix_allow_list_narrows_images() {
        let classifier =
            Classifier::new(&strings(&["jpg", "png"]), &strings(&["IMG_", "DSC"])).unwrap();
        assert_eq!(
            classifier.classify(Path::new("/src/IMG_0001.jpg")),
            FileKind::Image(Interlace::Jpeg)
        );
        assert_eq!(
            classifier.classify(Path::new("/src/DSC9.png")),
            FileKind::Image(Interlace::Png)
        );
        assert_eq!(
            classifier.classify(Path::new("/src/screenshot.png")),
            FileKind::Generic
        );
    }

    #[test]
    fn test_no_extensions_means_everything_generic() {
        let classifier = Classifier::new(&[], &[]).unwrap();
        assert_eq!(classifier.classify(Path::new("/a/b.jpg")), FileKind::Generic);
    }
}
