//! Per-destination option composition
//!
//! Every pair posts with *effective options*: the generic defaults, overridden
//! by the destination's defaults, overridden by what the user set on the
//! submission. Overrides are applied field by field and collections are
//! replaced wholesale. `tags` is the one additive field: a later layer that
//! sets `extend_default_tags = true` appends its tags to the earlier ones.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    General,
    Mature,
    Adult,
    Extreme,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    FollowersOnly,
}

/// Fields every destination understands
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenericOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend_default_tags: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_thumbnail: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scale: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

impl GenericOptions {
    /// Built-in baseline. Never sets a required field.
    pub fn defaults() -> Self {
        Self {
            tags: Some(Vec::new()),
            use_thumbnail: Some(true),
            auto_scale: Some(true),
            sources: Some(Vec::new()),
            ..Default::default()
        }
    }

    /// Apply `later` on top of `self`
    pub fn overlay(&self, later: &GenericOptions) -> GenericOptions {
        let tags = match (&self.tags, &later.tags) {
            (Some(earlier), Some(added)) if later.extend_default_tags == Some(true) => {
                let mut tags = earlier.clone();
                for tag in added {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
                Some(tags)
            }
            (earlier, later_tags) => later_tags.clone().or_else(|| earlier.clone()),
        };

        GenericOptions {
            title: later.title.clone().or_else(|| self.title.clone()),
            description: later.description.clone().or_else(|| self.description.clone()),
            tags,
            extend_default_tags: later.extend_default_tags.or(self.extend_default_tags),
            rating: later.rating.or(self.rating),
            use_thumbnail: later.use_thumbnail.or(self.use_thumbnail),
            auto_scale: later.auto_scale.or(self.auto_scale),
            sources: later.sources.clone().or_else(|| self.sources.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GalleryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_comments: Option<bool>,
}

impl GalleryOptions {
    fn overlay(&self, later: &GalleryOptions) -> GalleryOptions {
        GalleryOptions {
            folders: later.folders.clone().or_else(|| self.folders.clone()),
            private: later.private.or(self.private),
            allow_comments: later.allow_comments.or(self.allow_comments),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MicroblogOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoiler_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
}

impl MicroblogOptions {
    fn overlay(&self, later: &MicroblogOptions) -> MicroblogOptions {
        MicroblogOptions {
            visibility: later.visibility.or(self.visibility),
            spoiler_text: later.spoiler_text.clone().or_else(|| self.spoiler_text.clone()),
            sensitive: later.sensitive.or(self.sensitive),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BooruOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl BooruOptions {
    fn overlay(&self, later: &BooruOptions) -> BooruOptions {
        BooruOptions {
            parent_id: later.parent_id.clone().or_else(|| self.parent_id.clone()),
            notes: later.notes.clone().or_else(|| self.notes.clone()),
        }
    }
}

/// Destination-specific options, one variant per kind of destination
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteOptions {
    /// No options beyond the generic ones
    #[default]
    Basic,
    Gallery(GalleryOptions),
    Microblog(MicroblogOptions),
    Booru(BooruOptions),
}

impl SiteOptions {
    pub fn kind(&self) -> &'static str {
        match self {
            SiteOptions::Basic => "basic",
            SiteOptions::Gallery(_) => "gallery",
            SiteOptions::Microblog(_) => "microblog",
            SiteOptions::Booru(_) => "booru",
        }
    }
}

/// A full option set as written by a destination's defaults or by the user
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DestinationOptions {
    #[serde(flatten)]
    pub generic: GenericOptions,
    #[serde(default)]
    pub site: SiteOptions,
}

impl DestinationOptions {
    pub fn new(generic: GenericOptions, site: SiteOptions) -> Self {
        Self { generic, site }
    }
}

/// Options a pair is actually posted with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveOptions {
    pub destination: String,
    pub rating: Rating,
    #[serde(flatten)]
    pub options: DestinationOptions,
}

impl EffectiveOptions {
    pub fn title(&self) -> Option<&str> {
        self.options.generic.title.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        self.options.generic.tags.as_deref().unwrap_or(&[])
    }

    pub fn site(&self) -> &SiteOptions {
        &self.options.site
    }
}

fn overlay_site(
    destination: &str,
    earlier: &SiteOptions,
    later: &SiteOptions,
) -> Result<SiteOptions, ValidationError> {
    match (earlier, later) {
        (earlier, SiteOptions::Basic) => Ok(earlier.clone()),
        (SiteOptions::Gallery(a), SiteOptions::Gallery(b)) => Ok(SiteOptions::Gallery(a.overlay(b))),
        (SiteOptions::Microblog(a), SiteOptions::Microblog(b)) => {
            Ok(SiteOptions::Microblog(a.overlay(b)))
        }
        (SiteOptions::Booru(a), SiteOptions::Booru(b)) => Ok(SiteOptions::Booru(a.overlay(b))),
        (earlier, later) => Err(ValidationError::KindMismatch {
            destination: destination.to_string(),
            expected: earlier.kind().to_string(),
            found: later.kind().to_string(),
        }),
    }
}

/// Merge the three option layers for one destination and check required fields.
///
/// Pure: the inputs are never modified, so resolving one destination cannot
/// affect any other.
pub fn resolve(
    destination: &str,
    generic: &GenericOptions,
    destination_defaults: &DestinationOptions,
    user: &DestinationOptions,
) -> Result<EffectiveOptions, ValidationError> {
    let merged = DestinationOptions {
        generic: generic
            .overlay(&destination_defaults.generic)
            .overlay(&user.generic),
        site: overlay_site(destination, &destination_defaults.site, &user.site)?,
    };
    validate(destination, merged)
}

fn validate(destination: &str, options: DestinationOptions) -> Result<EffectiveOptions, ValidationError> {
    let missing = |field: &str| ValidationError::MissingField {
        destination: destination.to_string(),
        field: field.to_string(),
    };

    let rating = options.generic.rating.ok_or_else(|| missing("rating"))?;

    match &options.site {
        SiteOptions::Gallery(_) => {
            let has_title = options
                .generic
                .title
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty());
            if !has_title {
                return Err(missing("title"));
            }
        }
        SiteOptions::Booru(_) => {
            let has_tags = options.generic.tags.as_ref().is_some_and(|t| !t.is_empty());
            if !has_tags {
                return Err(missing("tags"));
            }
        }
        SiteOptions::Microblog(_) | SiteOptions::Basic => {}
    }

    Ok(EffectiveOptions {
        destination: destination.to_string(),
        rating,
        options,
    })
}
