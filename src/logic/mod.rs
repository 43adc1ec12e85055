pub mod addressing;
pub mod asset_ops;
pub mod cam_inject;
pub mod cam_map;
pub mod nc_tools;
pub mod path;
pub mod reference_ops;
pub mod schema;
pub mod split_merge;
pub mod tree;
