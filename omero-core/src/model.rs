use std::fmt;

use serde::{Deserialize, Serialize};

/// Upload folder reported for images that carry no folder annotation.
pub const DEFAULT_UPLOAD_FOLDER: &str = "uploads";

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Remote identifier of a project.
    ProjectId
);
entity_id!(
    /// Remote identifier of a dataset.
    DatasetId
);
entity_id!(
    /// Remote identifier of an image.
    ImageId
);
entity_id!(
    /// Remote identifier of a fileset, the unit of download deduplication.
    FilesetId
);
entity_id!(OriginalFileId);

/// One entry of a remote listing, in the order the server returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing<I> {
    pub id: I,
    pub name: String,
}

impl<I> Listing<I> {
    pub fn new(id: I, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalFile {
    pub id: OriginalFileId,
    pub name: String,
    pub size: u64,
}

/// Group of original files that together make up one imported acquisition.
///
/// Several images (series of a multi-image file, for example) can point at
/// the same fileset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fileset {
    pub id: FilesetId,
    pub files: Vec<OriginalFile>,
}

impl Fileset {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Returns true when `folder` names the server's default upload location.
pub fn is_default_upload_folder(folder: &str) -> bool {
    folder.trim().is_empty() || folder.trim().eq_ignore_ascii_case(DEFAULT_UPLOAD_FOLDER)
}
