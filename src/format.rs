//! Format dispatch. Pure lookups only: nothing here touches the network or disk.

use crate::error::{ViewerError, ViewerResult};
use crate::loaders::{fbx, gltf, obj, ply, placeholder, stl, AssetLoader};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetFormat {
    Gltf,
    Glb,
    Obj,
    Fbx,
    Stl,
    Ply,
    Blend,
    Dae,
    ThreeDs,
    X3d,
    Ma,
    Mb,
}

/// Whether a format is parsed into real geometry or shown as an icon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatTier {
    Parsed,
    Placeholder,
}

impl AssetFormat {
    pub const ALL: [AssetFormat; 12] = [
        AssetFormat::Gltf,
        AssetFormat::Glb,
        AssetFormat::Obj,
        AssetFormat::Fbx,
        AssetFormat::Stl,
        AssetFormat::Ply,
        AssetFormat::Blend,
        AssetFormat::Dae,
        AssetFormat::ThreeDs,
        AssetFormat::X3d,
        AssetFormat::Ma,
        AssetFormat::Mb,
    ];

    /// Accepts any case and an optional leading dot.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let normalized = hint.trim().trim_start_matches('.').to_ascii_lowercase();
        let format = match normalized.as_str() {
            "gltf" => AssetFormat::Gltf,
            "glb" => AssetFormat::Glb,
            "obj" => AssetFormat::Obj,
            "fbx" => AssetFormat::Fbx,
            "stl" => AssetFormat::Stl,
            "ply" => AssetFormat::Ply,
            "blend" => AssetFormat::Blend,
            "dae" => AssetFormat::Dae,
            "3ds" => AssetFormat::ThreeDs,
            "x3d" => AssetFormat::X3d,
            "ma" => AssetFormat::Ma,
            "mb" => AssetFormat::Mb,
            _ => return None,
        };
        Some(format)
    }

    pub fn extension(self) -> &'static str {
        match self {
            AssetFormat::Gltf => "gltf",
            AssetFormat::Glb => "glb",
            AssetFormat::Obj => "obj",
            AssetFormat::Fbx => "fbx",
            AssetFormat::Stl => "stl",
            AssetFormat::Ply => "ply",
            AssetFormat::Blend => "blend",
            AssetFormat::Dae => "dae",
            AssetFormat::ThreeDs => "3ds",
            AssetFormat::X3d => "x3d",
            AssetFormat::Ma => "ma",
            AssetFormat::Mb => "mb",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AssetFormat::Gltf => "glTF",
            AssetFormat::Glb => "GLB",
            AssetFormat::Obj => "OBJ",
            AssetFormat::Fbx => "FBX",
            AssetFormat::Stl => "STL",
            AssetFormat::Ply => "PLY",
            AssetFormat::Blend => "Blender",
            AssetFormat::Dae => "COLLADA",
            AssetFormat::ThreeDs => "3DS",
            AssetFormat::X3d => "X3D",
            AssetFormat::Ma => "Maya ASCII",
            AssetFormat::Mb => "Maya Binary",
        }
    }

    pub fn tier(self) -> FormatTier {
        match self {
            AssetFormat::Gltf
            | AssetFormat::Glb
            | AssetFormat::Obj
            | AssetFormat::Fbx
            | AssetFormat::Stl
            | AssetFormat::Ply => FormatTier::Parsed,
            AssetFormat::Blend
            | AssetFormat::Dae
            | AssetFormat::ThreeDs
            | AssetFormat::X3d
            | AssetFormat::Ma
            | AssetFormat::Mb => FormatTier::Placeholder,
        }
    }
}

/// Lower-cased extension of the locator's path, ignoring any query string or
/// fragment (`https://cdn/x/model.GLB?sig=1#top` gives `glb`).
pub fn extension_from_locator(locator: &str) -> Option<String> {
    let without_fragment = locator.split('#').next().unwrap_or(locator);
    let path = without_fragment.split('?').next().unwrap_or(without_fragment);
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Explicit hint first, locator extension second.
pub fn resolve_format(explicit_hint: Option<&str>, locator: &str) -> ViewerResult<AssetFormat> {
    let hint = match explicit_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
        Some(hint) => hint.to_string(),
        None => extension_from_locator(locator).unwrap_or_default(),
    };
    AssetFormat::from_hint(&hint).ok_or(ViewerError::UnsupportedFormat(hint))
}

/// Maps a format to its loader strategy.
pub fn loader_for(format: AssetFormat) -> Box<dyn AssetLoader> {
    match format {
        AssetFormat::Gltf | AssetFormat::Glb => Box::new(gltf::GltfLoader),
        AssetFormat::Obj => Box::new(obj::ObjLoader),
        AssetFormat::Fbx => Box::new(fbx::FbxLoader),
        AssetFormat::Stl => Box::new(stl::StlLoader),
        AssetFormat::Ply => Box::new(ply::PlyLoader),
        placeholder_format => Box::new(placeholder::PlaceholderLoader::new(placeholder_format)),
    }
}

pub fn dispatch(explicit_hint: Option<&str>, locator: &str) -> ViewerResult<(AssetFormat, Box<dyn AssetLoader>)> {
    let format = resolve_format(explicit_hint, locator)?;
    Ok((format, loader_for(format)))
}
