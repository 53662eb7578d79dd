//! Codec descriptions and the comparisons used by negotiation.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FsError;

/// Kind of media in a session.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Audio,
    Video,
    Application,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Application => "application",
        };
        write!(f, "{}", s)
    }
}

/// The id of a codec, which for RTP is the payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    /// A concrete id.
    Id(u8),
    /// Any id, picked by negotiation.
    Any,
    /// In preferences, removes the codec from negotiation.
    Disable,
}

impl CodecId {
    /// The id if it is a valid RTP payload type.
    pub fn payload_type(&self) -> Option<u8> {
        match self {
            CodecId::Id(v) if *v < 128 => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::Id(v) => write!(f, "{}", v),
            CodecId::Any => write!(f, "-1"),
            CodecId::Disable => write!(f, "-2"),
        }
    }
}

impl From<u8> for CodecId {
    fn from(v: u8) -> Self {
        CodecId::Id(v)
    }
}

/// An optional `name=value` parameter, like in an SDP fmtp line.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecParameter {
    pub name: String,
    pub value: String,
}

/// An RTCP feedback parameter, like `nack pli`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedbackParameter {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub extra_params: String,
}

/// A media codec.
///
/// For raw sessions the `encoding_name` is a caps string such as
/// `audio/x-raw,format=S16LE,rate=8000,channels=1`.
///
/// `PartialEq` compares everything, ignoring the order of the parameters.
/// Negotiation uses the looser [`Codec::is_equivalent()`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codec {
    /// Payload type.
    pub id: CodecId,
    /// Name of the encoding.
    pub encoding_name: Option<String>,
    /// Audio, video or application.
    pub media_type: MediaType,
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// Number of channels.
    pub channels: u32,
    /// RTCP minimum reporting interval in ms.
    pub minimum_reporting_interval: Option<u32>,
    /// Format parameters.
    pub optional_params: Vec<CodecParameter>,
    /// RTCP feedback parameters.
    pub feedback_params: Vec<FeedbackParameter>,
}

impl Codec {
    /// Creates a new codec with one channel and no parameters.
    pub fn new(
        id: impl Into<CodecId>,
        encoding_name: impl Into<String>,
        media_type: MediaType,
        clock_rate: u32,
    ) -> Self {
        Codec {
            id: id.into(),
            encoding_name: Some(encoding_name.into()),
            media_type,
            clock_rate,
            channels: 1,
            minimum_reporting_interval: None,
            optional_params: vec![],
            feedback_params: vec![],
        }
    }

    /// A raw codec from a caps string.
    pub fn raw(caps: impl Into<String>, media_type: MediaType) -> Self {
        Codec::new(CodecId::Any, caps, media_type, 0)
    }

    /// Set the number of channels.
    pub fn set_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Adds a format parameter.
    pub fn add_optional_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.optional_params.push(CodecParameter {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Builder variant of [`Codec::add_optional_parameter()`].
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_optional_parameter(name, value);
        self
    }

    /// Finds a format parameter by name (case insensitive) and optionally value.
    pub fn get_optional_parameter(
        &self,
        name: &str,
        value: Option<&str>,
    ) -> Option<&CodecParameter> {
        self.optional_params.iter().find(|p| {
            p.name.eq_ignore_ascii_case(name)
                && value.map(|v| p.value.eq_ignore_ascii_case(v)).unwrap_or(true)
        })
    }

    /// Removes all format parameters with this name.
    pub fn remove_optional_parameter(&mut self, name: &str) {
        self.optional_params
            .retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    /// Adds a feedback parameter.
    pub fn add_feedback_parameter(
        &mut self,
        kind: impl Into<String>,
        subtype: impl Into<String>,
        extra_params: impl Into<String>,
    ) {
        self.feedback_params.push(FeedbackParameter {
            kind: kind.into(),
            subtype: subtype.into(),
            extra_params: extra_params.into(),
        });
    }

    /// Finds a feedback parameter.
    pub fn get_feedback_parameter(
        &self,
        kind: &str,
        subtype: Option<&str>,
    ) -> Option<&FeedbackParameter> {
        self.feedback_params.iter().find(|p| {
            p.kind.eq_ignore_ascii_case(kind)
                && subtype
                    .map(|s| p.subtype.eq_ignore_ascii_case(s))
                    .unwrap_or(true)
        })
    }

    fn name_eq(&self, other: &Codec) -> bool {
        match (&self.encoding_name, &other.encoding_name) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    /// Whether two codecs are the same for negotiation.
    ///
    /// Encoding name (case insensitive), clock rate, channels and the normalized set
    /// of format parameters must match. The id does not matter.
    pub fn is_equivalent(&self, other: &Codec) -> bool {
        self.name_eq(other)
            && self.clock_rate == other.clock_rate
            && self.channels.max(1) == other.channels.max(1)
            && normalized_params(self) == normalized_params(other)
    }

    /// Whether this is a codec that is only used alongside a primary codec.
    pub fn is_secondary(&self) -> bool {
        let name = self.encoding_name.as_deref().unwrap_or("");
        name.eq_ignore_ascii_case("telephone-event") || name.eq_ignore_ascii_case("CN")
    }

    /// The encoding name parsed as caps. Used for raw sessions.
    pub fn to_caps(&self) -> Result<Caps, FsError> {
        let name = self
            .encoding_name
            .as_deref()
            .ok_or_else(|| FsError::invalid("The codec must have an encoding name"))?;
        Caps::parse(name).ok_or_else(|| {
            FsError::invalid(format!(
                "The encoding name for codec {} is not valid GstCaps",
                name
            ))
        })
    }
}

fn normalized_params(c: &Codec) -> Vec<(String, String)> {
    let mut v: Vec<_> = c
        .optional_params
        .iter()
        .map(|p| (p.name.to_ascii_lowercase(), p.value.trim().to_string()))
        .collect();
    v.sort();
    v
}

/// Every element in `a` has a match in `b`.
fn contains_all<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.iter().all(|x| b.iter().any(|y| eq(x, y)))
}

fn param_eq(a: &CodecParameter, b: &CodecParameter) -> bool {
    a.name.eq_ignore_ascii_case(&b.name) && a.value == b.value
}

fn feedback_eq(a: &FeedbackParameter, b: &FeedbackParameter) -> bool {
    a.kind.eq_ignore_ascii_case(&b.kind)
        && a.subtype.eq_ignore_ascii_case(&b.subtype)
        && a.extra_params.eq_ignore_ascii_case(&b.extra_params)
}

fn params_eq(a: &Codec, b: &Codec) -> bool {
    contains_all(&a.optional_params, &b.optional_params, param_eq)
        && contains_all(&b.optional_params, &a.optional_params, param_eq)
}

impl PartialEq for Codec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.media_type == other.media_type
            && self.clock_rate == other.clock_rate
            && self.channels == other.channels
            && self.minimum_reporting_interval == other.minimum_reporting_interval
            && self.name_eq(other)
            && params_eq(self, other)
            && contains_all(&self.feedback_params, &other.feedback_params, feedback_eq)
            && contains_all(&other.feedback_params, &self.feedback_params, feedback_eq)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} clock:{} channels:{}",
            self.id,
            self.media_type,
            self.encoding_name.as_deref().unwrap_or("(null)"),
            self.clock_rate,
            self.channels
        )?;
        if let Some(trr) = self.minimum_reporting_interval {
            write!(f, " trr-int={}", trr)?;
        }
        for p in &self.optional_params {
            write!(f, " {}={}", p.name, p.value)?;
        }
        for p in &self.feedback_params {
            write!(f, " {}/{}={}", p.kind, p.subtype, p.extra_params)?;
        }
        Ok(())
    }
}

/// Ordered comparison of two codec lists.
pub fn codec_list_are_equal(a: &[Codec], b: &[Codec]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// The codecs in `new` whose format parameters differ from the codec with the same
/// id in `old`. These have to be signaled to the peer again.
pub fn codecs_need_resend(old: &[Codec], new: &[Codec]) -> Vec<Codec> {
    new.iter()
        .filter(|n| {
            let Some(o) = old.iter().find(|o| o.id == n.id) else {
                return false;
            };
            !(o.name_eq(n) && params_eq(o, n))
        })
        .cloned()
        .collect()
}

/// Read a codec list, typically codec preferences, from a key file.
///
/// See [`codec_list_from_str()`] for the format.
pub fn codec_list_from_file(path: impl AsRef<Path>) -> Result<Vec<Codec>, FsError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        FsError::invalid(format!(
            "Could not read codec file {}: {}",
            path.display(),
            e
        ))
    })?;
    codec_list_from_str(&content)
}

/// Parse a codec list from key file text.
///
/// Every group is one codec named `[media/encoding_name]`. A `:n` suffix lets the
/// same encoding appear more than once. The keys `id`, `clock-rate`, `channels`
/// and `trr-int` set those fields, a negative id disables the codec. Keys like
/// `feedback:type/subtype` add feedback parameters and any other key is a format
/// parameter.
///
/// ```
/// use farstream::{codec_list_from_str, CodecId};
///
/// let codecs = codec_list_from_str("
/// [audio/PCMA]
/// clock-rate=8000
///
/// [audio/PCMU]
/// id=-1
/// ").unwrap();
///
/// assert_eq!(codecs.len(), 2);
/// assert_eq!(codecs[1].id, CodecId::Disable);
/// ```
///
/// Lines that are not a group, a `key=value` or a `#` comment make the whole text
/// invalid. Groups and values that can't be understood are skipped with a warning.
pub fn codec_list_from_str(s: &str) -> Result<Vec<Codec>, FsError> {
    let mut codecs = vec![];
    let mut current: Option<Codec> = None;
    let mut in_group = false;

    for (n, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(group) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            codecs.extend(current.take());
            current = codec_from_group(group);
            in_group = true;
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(FsError::invalid(format!(
                "Invalid line {} in codec file: {}",
                n + 1,
                line
            )));
        };
        if !in_group {
            return Err(FsError::invalid(format!(
                "Key {} outside of a group on line {}",
                key.trim(),
                n + 1
            )));
        }
        if let Some(codec) = &mut current {
            set_codec_key(codec, key.trim(), value.trim());
        }
    }
    codecs.extend(current);

    Ok(codecs)
}

fn codec_from_group(group: &str) -> Option<Codec> {
    let Some((media, rest)) = group.split_once('/') else {
        warn!("Invalid codec name: {}", group);
        return None;
    };
    let media_type = if media.eq_ignore_ascii_case("audio") {
        MediaType::Audio
    } else if media.eq_ignore_ascii_case("video") {
        MediaType::Video
    } else if media.eq_ignore_ascii_case("application") {
        MediaType::Application
    } else {
        warn!("Invalid media type in codec name {}", group);
        return None;
    };

    let name = rest.split(':').next().unwrap_or("");
    if name.is_empty() {
        warn!("Missing encoding name in codec name {}", group);
        return None;
    }

    let mut codec = Codec::new(CodecId::Any, name, media_type, 0);
    codec.channels = 0;
    Some(codec)
}

fn set_codec_key(codec: &mut Codec, key: &str, value: &str) {
    let name = codec.encoding_name.clone().unwrap_or_default();
    let bad = |what: &str| {
        warn!(
            "Error reading key {} of codec {}: {} is not {}",
            key, name, value, what
        )
    };

    if key.eq_ignore_ascii_case("clock-rate") {
        match value.parse() {
            Ok(v) => codec.clock_rate = v,
            Err(_) => bad("a clock rate"),
        }
    } else if key.eq_ignore_ascii_case("id") {
        match value.parse::<i64>() {
            Ok(v) if v < 0 => codec.id = CodecId::Disable,
            Ok(v) => match u8::try_from(v) {
                Ok(v) => codec.id = CodecId::Id(v),
                Err(_) => bad("a codec id"),
            },
            Err(_) => bad("a number"),
        }
    } else if key.eq_ignore_ascii_case("channels") {
        match value.parse() {
            Ok(v) => codec.channels = v,
            Err(_) => bad("a channel count"),
        }
    } else if key.eq_ignore_ascii_case("trr-int") {
        match value.parse() {
            Ok(v) => codec.minimum_reporting_interval = Some(v),
            Err(_) => bad("an interval"),
        }
    } else if let Some(fb) = key.strip_prefix("feedback:") {
        let (kind, subtype) = fb.split_once('/').unwrap_or((fb, ""));
        codec.add_feedback_parameter(kind, subtype, value);
    } else {
        codec.add_optional_parameter(key, value);
    }
}

/// One fixed caps structure: `media/type,field=value,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    /// Structure name, like `audio/x-raw`.
    pub name: String,
    /// Fields in order, with type annotations removed.
    pub fields: Vec<(String, String)>,
}

impl Caps {
    /// Parse a caps string. Returns `None` unless it is a single fixed structure.
    pub fn parse(s: &str) -> Option<Caps> {
        let s = s.trim();
        if s.is_empty() || s.contains(';') {
            return None;
        }

        let mut parts = split_fields(s)?.into_iter();
        let name = parts.next()?.trim().to_string();
        if !is_structure_name(&name) {
            return None;
        }

        let mut fields = vec![];
        for part in parts {
            let (k, v) = part.split_once('=')?;
            let k = k.trim();
            let mut v = v.trim();
            if k.is_empty() || v.is_empty() {
                return None;
            }
            // Type annotation, like (int)8000
            if v.starts_with('(') {
                let end = v.find(')')?;
                v = v[end + 1..].trim();
            }
            // Ranges, lists and arrays are not fixed.
            if v.starts_with('[') || v.starts_with('{') || v.starts_with('<') {
                return None;
            }
            fields.push((k.to_string(), v.trim_matches('"').to_string()));
        }

        Some(Caps { name, fields })
    }

    /// Value of a field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.as_str())
    }
}

fn is_structure_name(name: &str) -> bool {
    if name.eq_ignore_ascii_case("ANY") || name.eq_ignore_ascii_case("EMPTY") {
        return false;
    }
    let mut chars = name.chars();
    chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.:+".contains(c))
}

/// Split on commas outside of quotes.
fn split_fields(s: &str) -> Option<Vec<&str>> {
    let mut out = vec![];
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return None;
    }
    out.push(&s[start..]);
    Some(out)
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.fields {
            write!(f, ",{}={}", k, v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn vorbis(config: Option<&str>) -> Codec {
        let mut c = Codec::new(96, "VORBIS", MediaType::Audio, 90000);
        if let Some(v) = config {
            c.add_optional_parameter("configuration", v);
        }
        c
    }

    #[test]
    fn to_string_format() {
        let mut c = Codec::new(8, "PCMA", MediaType::Audio, 8000);
        c.add_optional_parameter("ptime", "20");
        c.add_feedback_parameter("nack", "pli", "");
        assert_eq!(
            c.to_string(),
            "8: audio PCMA clock:8000 channels:1 ptime=20 nack/pli="
        );
    }

    #[test]
    fn equal_ignores_param_order() {
        let a = Codec::new(0, "PCMU", MediaType::Audio, 8000)
            .with_parameter("a", "1")
            .with_parameter("b", "2");
        let b = Codec::new(0, "pcmu", MediaType::Audio, 8000)
            .with_parameter("B", "2")
            .with_parameter("A", "1");
        assert_eq!(a, b);

        let mut nameless = a.clone();
        nameless.encoding_name = None;
        assert_ne!(nameless, nameless.clone());
    }

    #[test]
    fn equivalent_ignores_id() {
        let a = Codec::new(96, "H264", MediaType::Video, 90000);
        let b = Codec::new(100, "h264", MediaType::Video, 90000);
        assert!(a.is_equivalent(&b));
        assert_ne!(a, b);

        let c = b.clone().with_parameter("profile-level-id", "42e01f");
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn need_resend_on_changed_config() {
        let list1 = vec![vorbis(Some("aaa"))];
        assert!(codecs_need_resend(&list1, &list1).is_empty());

        let list2 = vec![vorbis(None)];
        assert_eq!(codecs_need_resend(&list1, &list2), list2);
        assert_eq!(codecs_need_resend(&list2, &list1), list1);

        let list3 = vec![vorbis(Some("bbb"))];
        assert_eq!(codecs_need_resend(&list1, &list3), list3);
    }

    #[test]
    fn list_equality_is_ordered() {
        let a = Codec::new(0, "PCMU", MediaType::Audio, 8000);
        let b = Codec::new(8, "PCMA", MediaType::Audio, 8000);
        assert!(codec_list_are_equal(&[a.clone(), b.clone()], &[a.clone(), b.clone()]));
        assert!(!codec_list_are_equal(&[a.clone(), b.clone()], &[b, a.clone()]));
        assert!(!codec_list_are_equal(&[a.clone()], &[]));
    }

    #[test]
    fn codec_list_from_key_file() {
        let text = "
# Preferred codecs
[audio/codec1]
clock-rate=8000

[audio/codec1:1]
clock-rate = 16000
channels=2

[audio/codec2]
one_param=QCIF
another_param=WOW

[video/codec3]
id=96
wierd_param=42
feedback:nack/pli=1
feedback:tfrc=

[audio/disabled]
id=-1

[nonsense/codec4]
clock-rate=1

[audio/codec5]
clock-rate=fast
";
        let codecs = codec_list_from_str(text).unwrap();
        let names: Vec<_> = codecs
            .iter()
            .map(|c| c.encoding_name.as_deref().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["codec1", "codec1", "codec2", "codec3", "disabled", "codec5"]
        );

        assert_eq!(codecs[0].clock_rate, 8000);
        assert_eq!(codecs[0].id, CodecId::Any);
        assert_eq!(codecs[1].clock_rate, 16000);
        assert_eq!(codecs[1].channels, 2);

        let param = codecs[2].get_optional_parameter("one_param", None).unwrap();
        assert_eq!(param.value, "QCIF");
        assert!(codecs[2].get_optional_parameter("another_param", None).is_some());

        let video = &codecs[3];
        assert_eq!(video.media_type, MediaType::Video);
        assert_eq!(video.id, CodecId::Id(96));
        assert!(video.get_optional_parameter("wierd_param", Some("42")).is_some());
        assert!(video.get_feedback_parameter("nack", Some("pli")).is_some());
        let tfrc = video.get_feedback_parameter("tfrc", None).unwrap();
        assert_eq!(tfrc.subtype, "");
        assert_eq!(tfrc.extra_params, "");

        assert_eq!(codecs[4].id, CodecId::Disable);
        // A bad value is skipped, the codec stays.
        assert_eq!(codecs[5].clock_rate, 0);
    }

    #[test]
    fn codec_key_file_errors() {
        let e = codec_list_from_str("clock-rate=8000\n[audio/PCMU]\n").unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);

        let e = codec_list_from_str("[audio/PCMU]\nnot a key\n").unwrap_err();
        assert_eq!(e.message(), "Invalid line 2 in codec file: not a key");

        assert!(codec_list_from_str("").unwrap().is_empty());

        let e = codec_list_from_file("/nonexistent/codecs.conf").unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidArguments);
    }

    #[test]
    fn codec_list_from_written_file() {
        let path = std::env::temp_dir()
            .join(format!("farstream-codecs-{}.conf", std::process::id()));
        std::fs::write(&path, "[audio/PCMA]\nclock-rate=8000\nid=8\n").unwrap();
        let codecs = codec_list_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(codecs, vec![Codec::new(8, "PCMA", MediaType::Audio, 8000).set_channels(0)]);
    }

    #[test]
    fn parse_fixed_caps() {
        let caps = Caps::parse("audio/x-raw,format=S16LE,rate=(int)8000,channels=1").unwrap();
        assert_eq!(caps.name, "audio/x-raw");
        assert_eq!(caps.get("rate"), Some("8000"));
        assert_eq!(caps.get("format"), Some("S16LE"));
        assert_eq!(
            caps.to_string(),
            "audio/x-raw,format=S16LE,rate=8000,channels=1"
        );
    }

    #[test]
    fn reject_unfixed_caps() {
        assert!(Caps::parse("audio/x-raw,rate=[8000,48000]").is_none());
        assert!(Caps::parse("audio/x-raw,format={S16LE,S32LE}").is_none());
        assert!(Caps::parse("audio/x-raw; video/x-raw").is_none());
        assert!(Caps::parse("ANY").is_none());
        assert!(Caps::parse("").is_none());
        assert!(Caps::parse("audio/x-raw,rate").is_none());
    }

    #[test]
    fn raw_codec_to_caps_error() {
        let c = Codec::raw("nonsense,rate=[1,2]", MediaType::Audio);
        let err = c.to_caps().unwrap_err();
        assert_eq!(
            err.message(),
            "The encoding name for codec nonsense,rate=[1,2] is not valid GstCaps"
        );
    }
}
