use std::fmt;

use tracing::warn;

/// Default cap on a single input message.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 2048;

const ESC: u8 = 0x1b;

// ---------------------------------------------------------------------------
// Pattern table
// ---------------------------------------------------------------------------

/// Families of escape sequences a client is never allowed to inject.
///
/// Each of these is either a terminal-to-host report that a client could
/// forge, or a host-to-terminal command that, echoed back by the line
/// discipline, would act on other viewers' terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternCategory {
    /// `ESC ]`: operating system commands (clipboard, title, colour queries).
    Osc,
    /// `ESC P`: device control strings.
    Dcs,
    /// `ESC _`: application program commands.
    Apc,
    /// `ESC ^`: privacy messages.
    Pm,
    /// `ESC X`: start of string.
    Sos,
    /// `CSI … t`: window manipulation and title reports.
    WindowOps,
    /// `CSI ? … c` / `CSI > … c`: device attribute reports.
    DeviceAttributes,
    /// `CSI 201 ~` followed by more bytes: escape from bracketed paste.
    ///
    /// Only detected within one chunk. Validation keeps no state between
    /// messages, so a chunk ending in `CSI 201 ~` passes and whatever the
    /// next message carries is not tied back to it.
    PasteEscape,
}

impl PatternCategory {
    pub const ALL: [PatternCategory; 8] = [
        PatternCategory::Osc,
        PatternCategory::Dcs,
        PatternCategory::Apc,
        PatternCategory::Pm,
        PatternCategory::Sos,
        PatternCategory::WindowOps,
        PatternCategory::DeviceAttributes,
        PatternCategory::PasteEscape,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Osc => "osc",
            PatternCategory::Dcs => "dcs",
            PatternCategory::Apc => "apc",
            PatternCategory::Pm => "pm",
            PatternCategory::Sos => "sos",
            PatternCategory::WindowOps => "window_ops",
            PatternCategory::DeviceAttributes => "device_attributes",
            PatternCategory::PasteEscape => "paste_escape",
        }
    }

    /// String-type introducers (`ESC <byte>`) map straight to a category.
    fn from_introducer(byte: u8) -> Option<Self> {
        match byte {
            b']' => Some(PatternCategory::Osc),
            b'P' => Some(PatternCategory::Dcs),
            b'_' => Some(PatternCategory::Apc),
            b'^' => Some(PatternCategory::Pm),
            b'X' => Some(PatternCategory::Sos),
            _ => None,
        }
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("input of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("input contains a blocked control sequence ({category}) at byte {offset}")]
    DangerousPattern {
        category: PatternCategory,
        offset: usize,
    },
}

impl ValidationError {
    /// Stable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::TooLarge { .. } => "TOO_LARGE",
            ValidationError::DangerousPattern { .. } => "DANGEROUS_PATTERN",
        }
    }
}

// ---------------------------------------------------------------------------
// InputValidator
// ---------------------------------------------------------------------------

/// Admits or rejects a raw input chunk. Never rewrites it.
#[derive(Debug, Clone)]
pub struct InputValidator {
    max_bytes: usize,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl InputValidator {
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Check `raw` and hand it back untouched when it is acceptable.
    ///
    /// The size limit is checked before any scanning.
    pub fn validate<'a>(&self, raw: &'a [u8]) -> Result<&'a [u8], ValidationError> {
        if raw.len() > self.max_bytes {
            warn!(size = raw.len(), max = self.max_bytes, "input rejected: too large");
            return Err(ValidationError::TooLarge {
                size: raw.len(),
                max: self.max_bytes,
            });
        }
        if let Some((offset, category)) = find_dangerous(raw) {
            warn!(%category, offset, "input rejected: dangerous control sequence");
            return Err(ValidationError::DangerousPattern { category, offset });
        }
        Ok(raw)
    }
}

/// Validate with the default limit.
pub fn validate(raw: &[u8]) -> Result<&[u8], ValidationError> {
    InputValidator::default().validate(raw)
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Locate the first blocked sequence. Only 7-bit `ESC`-introduced forms are
/// considered; 8-bit C1 bytes are ordinary UTF-8 continuation bytes here.
fn find_dangerous(data: &[u8]) -> Option<(usize, PatternCategory)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] != ESC {
            i += 1;
            continue;
        }
        let Some(&next) = data.get(i + 1) else {
            break;
        };
        if let Some(category) = PatternCategory::from_introducer(next) {
            return Some((i, category));
        }
        if next == b'[' {
            if let Some(csi) = Csi::parse(&data[i + 2..]) {
                let end = i + 2 + csi.len;
                if let Some(category) = csi.classify(end < data.len()) {
                    return Some((i, category));
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// A complete control sequence introducer body: `params intermediates final`.
struct Csi<'a> {
    params: &'a [u8],
    final_byte: u8,
    /// Bytes consumed after `ESC [`, final byte included.
    len: usize,
}

impl<'a> Csi<'a> {
    fn parse(body: &'a [u8]) -> Option<Self> {
        let params_end = body
            .iter()
            .position(|b| !(0x30..=0x3f).contains(b))
            .unwrap_or(body.len());
        let inter_end = params_end
            + body[params_end..]
                .iter()
                .position(|b| !(0x20..=0x2f).contains(b))
                .unwrap_or(body.len() - params_end);
        let final_byte = *body.get(inter_end)?;
        if !(0x40..=0x7e).contains(&final_byte) {
            return None;
        }
        Some(Self {
            params: &body[..params_end],
            final_byte,
            len: inter_end + 1,
        })
    }

    fn classify(&self, followed_by_more: bool) -> Option<PatternCategory> {
        match self.final_byte {
            b't' => Some(PatternCategory::WindowOps),
            b'c' if matches!(self.params.first(), Some(b'?' | b'>')) => {
                Some(PatternCategory::DeviceAttributes)
            }
            b'~' if self.params == b"201" && followed_by_more => Some(PatternCategory::PasteEscape),
            _ => None,
        }
    }
}
