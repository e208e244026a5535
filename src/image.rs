#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Parsed { application: String, version: String },
    /// No tag could be found. Callers skip the workload.
    Unparseable,
}

/// Splits the last path segment on its last `:`, so a registry port is never read as a tag.
pub fn parse_image_reference(image: &str) -> ImageRef {
    let image = image.trim();

    // `name:tag@digest` keeps its tag
    let image = match image.split_once('@') {
        Some((name, _digest)) => name,
        None => image,
    };

    let last_segment = image.rsplit('/').next().unwrap_or(image);

    match last_segment.rsplit_once(':') {
        Some((application, version)) if !application.is_empty() && !version.is_empty() => {
            ImageRef::Parsed {
                application: application.to_string(),
                version: version.to_string(),
            }
        }
        _ => ImageRef::Unparseable,
    }
}
