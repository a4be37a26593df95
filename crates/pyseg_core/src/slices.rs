//! Picking slices descriptor.
//!
//! The picking program reads an XML file whose first `<mb_slice>` element
//! selects the segmentation area (`<side>`) and whether projections are
//! kept (`<cont>`). A copy of the bundled template is written per run with
//! those two fields replaced; everything else is left byte-for-byte.

use crate::error::ErrorKind;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const XML_DECLARATION: &str = "<?xml version='1.0' encoding='UTF-8'?>";

static DECLARATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*<\?xml[^>]*\?>\s*").expect("valid declaration regex"));
static MB_SLICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<mb_slice\b[^>]*>.*?</mb_slice>").expect("valid slice regex"));
static SIDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(<side\b[^>]*>).*?(</side>)").expect("valid side regex"));
static CONT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(<cont\b[^>]*>).*?(</cont>)").expect("valid cont regex"));

/// Segmentation areas offered for picking, in selector order.
pub const PRESEG_AREAS: &[&str] = &["Inner vesicle", "Membrane", "Outer vesicle"];
/// Selector index of the membrane area.
pub const MEMBRANE_AREA: usize = 1;

/// Which filament points become picking candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CuttingMode {
    /// Only the point where the filament crosses the area.
    #[default]
    CuttingPoint,
    /// Cutting point plus its projections.
    Projections,
}

impl CuttingMode {
    /// Symbol expected in `<cont>`.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::CuttingPoint => "+",
            Self::Projections => "-",
        }
    }
}

/// PySeg label of a selector index: 0 is background, so areas start at 1.
pub fn encode_preseg_area(area_index: usize) -> usize {
    area_index + 1
}

/// Slices descriptor failures.
#[derive(Debug)]
pub enum SlicesError {
    Io { path: PathBuf, source: std::io::Error },
    MissingElement { path: PathBuf, element: &'static str },
}

impl SlicesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::MissingElement { .. } => ErrorKind::Format,
        }
    }
}

impl Display for SlicesError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::MissingElement { path, element } => {
                write!(f, "slices file {} has no <{element}> element", path.display())
            }
        }
    }
}

impl Error for SlicesError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::MissingElement { .. } => None,
        }
    }
}

/// Rewrites `side` and `cont` in the first `<mb_slice>` of `xml`.
pub fn rewrite_slices(
    xml: &str,
    side: usize,
    cont: CuttingMode,
) -> Result<String, &'static str> {
    let body = DECLARATION_RE.replace(xml, "");
    let slice = MB_SLICE_RE.find(&body).ok_or("mb_slice")?;
    let text = slice.as_str();
    if !SIDE_RE.is_match(text) {
        return Err("side");
    }
    if !CONT_RE.is_match(text) {
        return Err("cont");
    }

    let side_text = side.to_string();
    let edited = SIDE_RE.replace(text, |caps: &Captures<'_>| {
        format!("{}{side_text}{}", &caps[1], &caps[2])
    });
    let edited = CONT_RE.replace(&edited, |caps: &Captures<'_>| {
        format!("{}{}{}", &caps[1], cont.symbol(), &caps[2])
    });

    let mut out = String::with_capacity(body.len() + XML_DECLARATION.len() + 1);
    out.push_str(XML_DECLARATION);
    out.push('\n');
    out.push_str(&body[..slice.start()]);
    out.push_str(&edited);
    out.push_str(&body[slice.end()..]);
    Ok(out)
}

/// Copies `template` into `out_dir` under the same file name, with the
/// first slice set to PySeg label `side` and mode `cont`.
pub fn write_picking_slices(
    template: &Path,
    out_dir: &Path,
    side: usize,
    cont: CuttingMode,
) -> Result<PathBuf, SlicesError> {
    let xml = std::fs::read_to_string(template).map_err(|source| SlicesError::Io {
        path: template.to_path_buf(),
        source,
    })?;
    let edited = rewrite_slices(&xml, side, cont).map_err(|element| {
        SlicesError::MissingElement {
            path: template.to_path_buf(),
            element,
        }
    })?;

    let file_name = template.file_name().unwrap_or_default();
    let out_path = out_dir.join(file_name);
    std::fs::write(&out_path, edited).map_err(|source| SlicesError::Io {
        path: out_path.clone(),
        source,
    })?;
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::{encode_preseg_area, rewrite_slices, write_picking_slices, CuttingMode, SlicesError};

    const TEMPLATE: &str = r#"<?xml version="1.0"?>
<mb_slices>
  <mb_slice>
    <name>mb_ext</name>
    <side>2</side>
    <cont>-</cont>
  </mb_slice>
  <mb_slice>
    <name>second</name>
    <side>3</side>
    <cont>-</cont>
  </mb_slice>
</mb_slices>
"#;

    #[test]
    fn rewrites_only_the_first_slice() {
        let out = rewrite_slices(TEMPLATE, encode_preseg_area(0), CuttingMode::CuttingPoint)
            .expect("template is valid");
        assert!(out.starts_with("<?xml version='1.0' encoding='UTF-8'?>\n<mb_slices>"));
        assert!(out.contains("<side>1</side>\n    <cont>+</cont>"));
        assert!(out.contains("<side>3</side>\n    <cont>-</cont>"));
        assert_eq!(out.matches("<?xml").count(), 1);
    }

    #[test]
    fn reports_missing_elements() {
        assert_eq!(
            rewrite_slices("<mb_slices/>", 1, CuttingMode::Projections),
            Err("mb_slice")
        );
        assert_eq!(
            rewrite_slices("<mb_slice><side>1</side></mb_slice>", 1, CuttingMode::Projections),
            Err("cont")
        );
    }

    #[test]
    fn writes_copy_next_to_outputs() {
        let dir = tempfile::tempdir().expect("temp dir");
        let template = dir.path().join("mb_ext.xml");
        std::fs::write(&template, TEMPLATE).expect("write template");
        let out_dir = dir.path().join("extra");
        std::fs::create_dir(&out_dir).expect("create out dir");

        let written = write_picking_slices(&template, &out_dir, 2, CuttingMode::Projections)
            .expect("slices written");
        assert_eq!(written, out_dir.join("mb_ext.xml"));
        let text = std::fs::read_to_string(&written).expect("read copy");
        assert!(text.contains("<side>2</side>\n    <cont>-</cont>"));
        // The template itself is untouched.
        assert_eq!(std::fs::read_to_string(&template).expect("read template"), TEMPLATE);
    }

    #[test]
    fn missing_template_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = write_picking_slices(
            &dir.path().join("absent.xml"),
            dir.path(),
            2,
            CuttingMode::CuttingPoint,
        )
        .expect_err("absent template");
        assert!(matches!(err, SlicesError::Io { .. }));
    }
}
