pub mod asset;
pub mod element;
pub mod error;
pub mod reference;

pub use asset::{
    collect_ref_keys, AssetDocument, AssetGroup, AssetKeys, AssetMeta, AssetQuery, Id, NewAsset,
    RefKeyEntry,
};
pub use element::{local_name_of, Element};
pub use error::CoreError;
pub use reference::{build_reference_element, reference_fullpath, rule_for, AnchorKind, RefParam, RefRule};
