use crate::error::{ErrorKind, Result};
use crate::estimate::SizeEstimate;
use crate::format::{AltCommand, Format, Shortcut, Usage};
use crate::replaygain::ReplayGainFormula;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Format as _, Json, Toml, Yaml};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

const BUILTIN: &str = include_str!("../formats.toml");

type TagFormulas = BTreeMap<String, ReplayGainFormula>;

/// The on-disk shape of a format definitions file.
#[derive(Debug, Deserialize)]
struct Definitions {
    /// Named replaygain tag sets formats can refer to.
    #[serde(default)]
    replaygain: BTreeMap<String, TagFormulas>,
    #[serde(default, rename = "format")]
    formats: Vec<Definition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplayGainSpec {
    Preset(String),
    Inline(TagFormulas),
}

#[derive(Debug, Deserialize)]
struct Definition {
    name: String,
    display_name: Option<String>,
    subtitle: Option<String>,
    usage: Usage,
    extension: String,
    mime_type: String,
    args: Vec<String>,
    alt_command: Option<AltCommand>,
    #[serde(default)]
    direct: bool,
    #[serde(default = "yes")]
    cache: bool,
    #[serde(default)]
    lossless: bool,
    #[serde(default)]
    uncompressed: bool,
    #[serde(default)]
    requires_encumbered: bool,
    size_estimate: SizeEstimate,
    replaygain: Option<ReplayGainSpec>,
    #[serde(default)]
    shortcuts: Vec<Shortcut>,
}

fn yes() -> bool {
    true
}

impl Definition {
    fn resolve(self, presets: &BTreeMap<String, TagFormulas>) -> Result<Format> {
        let replaygain = match self.replaygain {
            None => TagFormulas::new(),
            Some(ReplayGainSpec::Inline(formulas)) => formulas,
            Some(ReplayGainSpec::Preset(preset)) => presets
                .get(&preset)
                .cloned()
                .ok_or_raise(|| ErrorKind::UnknownPreset(self.name.clone(), preset.clone()))?,
        };
        if self.extension.is_empty() || self.extension.contains(['/', '.']) {
            exn::bail!(ErrorKind::Invalid(self.name, "extension must be a bare file extension"));
        }
        if self.args.is_empty() {
            exn::bail!(ErrorKind::Invalid(self.name, "encoder arguments are required"));
        }
        if !self.direct && !self.cache {
            exn::bail!(ErrorKind::Invalid(self.name, "a format must be direct, cached, or both"));
        }
        Ok(Format {
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            subtitle: self.subtitle,
            usage: self.usage,
            extension: self.extension,
            mime_type: self.mime_type,
            args: self.args,
            alt_command: self.alt_command,
            direct: self.direct,
            cache: self.cache,
            lossless: self.lossless,
            uncompressed: self.uncompressed,
            requires_encumbered: self.requires_encumbered,
            size_estimate: self.size_estimate,
            replaygain,
            shortcuts: self.shortcuts,
        })
    }
}

/// The validated table of target formats.
///
/// Formats keep their definition order, which is the order they are offered
/// in.
#[derive(Debug, Clone)]
pub struct Formats {
    list: Vec<Arc<Format>>,
    by_name: HashMap<String, usize>,
}
impl Formats {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        let definitions = Figment::from(Toml::string(BUILTIN)).extract().or_raise(|| ErrorKind::Builtin)?;
        Self::from_definitions(definitions)
    }

    /// Load a definitions file; the extension picks TOML, YAML or JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Figment::from(Yaml::file_exact(path)),
            Some("json") => Figment::from(Json::file_exact(path)),
            _ => Figment::from(Toml::file_exact(path)),
        };
        let definitions = figment.extract().or_raise(|| ErrorKind::Load(path.to_path_buf()))?;
        let formats = Self::from_definitions(definitions)?;
        tracing::debug!(path = %path.display(), count = formats.len(), "Loaded format definitions");
        Ok(formats)
    }

    fn from_definitions(definitions: Definitions) -> Result<Self> {
        let list = definitions
            .formats
            .into_iter()
            .map(|d| d.resolve(&definitions.replaygain).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Self::new(list)
    }

    /// Build a table from already constructed formats, validating the
    /// shortcut relation.
    pub fn new(list: Vec<Arc<Format>>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(list.len());
        for (index, format) in list.iter().enumerate() {
            if by_name.insert(format.name.clone(), index).is_some() {
                exn::bail!(ErrorKind::Duplicate(format.name.clone()));
            }
        }
        for format in &list {
            let mut seen = HashSet::new();
            for shortcut in &format.shortcuts {
                if shortcut.source == format.name {
                    exn::bail!(ErrorKind::SelfShortcut(format.name.clone()));
                }
                if !by_name.contains_key(&shortcut.source) {
                    exn::bail!(ErrorKind::UnknownShortcut(format.name.clone(), shortcut.source.clone()));
                }
                if !seen.insert(shortcut.source.as_str()) {
                    exn::bail!(ErrorKind::Invalid(format.name.clone(), "shortcut source listed twice"));
                }
            }
        }
        Ok(Self { list, by_name })
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Format>> {
        self.by_name.get(name).map(|&index| &self.list[index])
    }

    /// All variants sharing a public name, in definition order.
    pub fn by_public_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Arc<Format>> + 'a {
        self.list.iter().filter(move |f| f.public_name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Format>> {
        self.list.iter()
    }

    /// Formats that can be offered on this system.
    pub fn available(&self, allow_encumbered: bool) -> impl Iterator<Item = &Arc<Format>> {
        self.list.iter().filter(move |f| f.available(allow_encumbered))
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
