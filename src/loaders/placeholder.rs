use super::{AssetLoader, LoadError, LoadedAsset, ParseContext};
use crate::format::AssetFormat;
use crate::geometry::{Geometry, Material, MaterialHandle, PLACEHOLDER_COLOR};
use crate::scene::{SceneArena, Transform};
use anyhow::Result;

const GLYPH_SIZE: f32 = 1.0;

/// Formats without a parser. Skips the fetch entirely and shows a labelled
/// cube so the viewer still reaches a ready state.
pub struct PlaceholderLoader {
    format: AssetFormat,
}

impl PlaceholderLoader {
    pub fn new(format: AssetFormat) -> Self {
        Self { format }
    }

    pub fn glyph_name(format: AssetFormat) -> String {
        format!("{} preview unavailable", format.label())
    }

    fn glyph(&self) -> LoadedAsset {
        let mut tree = SceneArena::new();
        let geometry = Geometry::cube(GLYPH_SIZE).into_handle();
        let material = MaterialHandle::new(Material::new("placeholder", PLACEHOLDER_COLOR));
        tree.add_mesh_node(None, Some(Self::glyph_name(self.format)), Transform::IDENTITY, geometry, material);
        let mut asset = LoadedAsset::new(self.format, tree);
        asset.placeholder = true;
        asset
    }
}

impl AssetLoader for PlaceholderLoader {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn parse(&self, _bytes: &[u8], _ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        Ok(self.glyph())
    }

    fn load(&self, ctx: &ParseContext<'_>, progress: &mut dyn FnMut(f32)) -> Result<LoadedAsset, LoadError> {
        ctx.token.check()?;
        log::info!("[loader] no parser for {}; showing placeholder for {}", self.format.label(), ctx.locator);
        progress(1.0);
        Ok(self.glyph())
    }
}
