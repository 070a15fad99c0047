use super::{AssetLoader, LoadedAsset, ParseContext};
use crate::geometry::{default_base_color, Geometry, Material, MaterialHandle};
use crate::scene::{SceneArena, Transform};
use anyhow::{anyhow, bail, Context, Result};
use glam::{Vec2, Vec3};
use std::collections::HashMap;

/// Wavefront OBJ. `o`/`g` statements become child nodes; `mtllib` diffuse
/// colors are applied when the library can be fetched.
pub struct ObjLoader;

#[derive(Default)]
struct ObjGroup {
    name: Option<String>,
    material: Option<String>,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
    has_normals: bool,
    has_uvs: bool,
    indices: Vec<u32>,
    corners: HashMap<(usize, Option<usize>, Option<usize>), u32>,
}

impl ObjGroup {
    fn named(name: Option<String>, material: Option<String>) -> Self {
        Self { name, material, ..Default::default() }
    }

    fn corner(&mut self, key: (usize, Option<usize>, Option<usize>), pools: &Pools) -> u32 {
        if let Some(index) = self.corners.get(&key) {
            return *index;
        }
        let index = self.positions.len() as u32;
        self.positions.push(pools.positions[key.0]);
        match key.1.and_then(|i| pools.uvs.get(i)) {
            Some(uv) => {
                self.uvs.push(*uv);
                self.has_uvs = true;
            }
            None => self.uvs.push(Vec2::ZERO),
        }
        match key.2.and_then(|i| pools.normals.get(i)) {
            Some(normal) => {
                self.normals.push(*normal);
                self.has_normals = true;
            }
            None => self.normals.push(Vec3::ZERO),
        }
        self.corners.insert(key, index);
        index
    }
}

#[derive(Default)]
struct Pools {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
}

impl AssetLoader for ObjLoader {
    fn name(&self) -> &'static str {
        "obj"
    }

    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        let text = std::str::from_utf8(bytes).context("OBJ is not valid UTF-8")?;
        let mut asset = LoadedAsset::new(ctx.format, SceneArena::new());
        let mut pools = Pools::default();
        let mut groups: Vec<ObjGroup> = vec![ObjGroup::default()];
        let mut libraries: Vec<String> = Vec::new();
        let mut unknown: HashMap<String, usize> = HashMap::new();

        for (line_index, raw_line) in text.lines().enumerate() {
            let line_no = line_index + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(keyword) = parts.next() else {
                continue;
            };
            match keyword {
                "v" => pools.positions.push(parse_vec3(&mut parts, line_no)?),
                "vn" => pools.normals.push(parse_vec3(&mut parts, line_no)?),
                "vt" => {
                    let u = parse_float(parts.next(), line_no)?;
                    let v = parts.next().map(|s| parse_float(Some(s), line_no)).transpose()?.unwrap_or(0.0);
                    pools.uvs.push(Vec2::new(u, v));
                }
                "f" => {
                    let mut keys = Vec::new();
                    for corner in parts {
                        keys.push(parse_corner(corner, &pools, line_no)?);
                    }
                    if keys.len() < 3 {
                        asset.skip(format!("line {line_no}: face with {} corners", keys.len()));
                        continue;
                    }
                    let group = groups.last_mut().ok_or_else(|| anyhow!("no active group"))?;
                    let corners: Vec<u32> = keys.into_iter().map(|key| group.corner(key, &pools)).collect();
                    for i in 1..corners.len() - 1 {
                        group.indices.extend_from_slice(&[corners[0], corners[i], corners[i + 1]]);
                    }
                }
                "o" | "g" => {
                    let name = parts.collect::<Vec<_>>().join(" ");
                    let material = groups.last().and_then(|g| g.material.clone());
                    start_group(&mut groups, Some(name).filter(|n| !n.is_empty()), material);
                }
                "usemtl" => {
                    let material = parts.next().map(str::to_string);
                    let (name, current) = match groups.last() {
                        Some(g) => (g.name.clone(), g.material.clone()),
                        None => (None, None),
                    };
                    if current != material {
                        start_group(&mut groups, name, material);
                    }
                }
                "mtllib" => libraries.extend(parts.map(str::to_string)),
                "s" => {}
                other => *unknown.entry(other.to_string()).or_default() += 1,
            }
        }
        for (keyword, count) in unknown {
            asset.skip(format!("{count} '{keyword}' statement(s)"));
        }

        let library = load_material_library(&libraries, ctx, &mut asset);
        let mut materials: HashMap<Option<String>, MaterialHandle> = HashMap::new();
        let mut slot = 0u32;
        let multiple = groups.iter().filter(|g| !g.indices.is_empty()).count() > 1;
        let root = multiple.then(|| asset.tree.add_node(None, Some("obj_root".into()), Transform::IDENTITY));
        for group in groups.into_iter().filter(|g| !g.indices.is_empty()) {
            let material = materials
                .entry(group.material.clone())
                .or_insert_with(|| {
                    let label = group.material.clone().unwrap_or_else(|| "default".to_string());
                    let from_library = group.material.as_ref().and_then(|name| library.get(name).copied());
                    let color = from_library.unwrap_or_else(|| {
                        let color = default_base_color(ctx.load_sequence, slot);
                        slot += 1;
                        color
                    });
                    MaterialHandle::new(Material::new(label, color))
                })
                .clone();
            let normals = group.has_normals.then_some(group.normals);
            let uvs = group.has_uvs.then_some(group.uvs);
            let geometry = Geometry::new(group.positions, normals, uvs, group.indices).into_handle();
            asset.tree.add_mesh_node(root, group.name, Transform::IDENTITY, geometry, material);
        }
        Ok(asset)
    }
}

fn start_group(groups: &mut Vec<ObjGroup>, name: Option<String>, material: Option<String>) {
    match groups.last_mut() {
        Some(current) if current.indices.is_empty() => {
            current.name = name;
            current.material = material;
        }
        _ => groups.push(ObjGroup::named(name, material)),
    }
}

fn parse_float(token: Option<&str>, line_no: usize) -> Result<f32> {
    let token = token.ok_or_else(|| anyhow!("line {line_no}: missing number"))?;
    token.parse::<f32>().map_err(|_| anyhow!("line {line_no}: invalid number '{token}'"))
}

fn parse_vec3<'a>(parts: &mut impl Iterator<Item = &'a str>, line_no: usize) -> Result<Vec3> {
    Ok(Vec3::new(
        parse_float(parts.next(), line_no)?,
        parse_float(parts.next(), line_no)?,
        parse_float(parts.next(), line_no)?,
    ))
}

/// One-based, or negative relative to the end of the pool.
fn resolve_index(raw: &str, pool_len: usize, line_no: usize) -> Result<usize> {
    let value: i64 = raw.parse().map_err(|_| anyhow!("line {line_no}: invalid index '{raw}'"))?;
    let resolved = if value > 0 { value - 1 } else { pool_len as i64 + value };
    if value == 0 || resolved < 0 || resolved as usize >= pool_len {
        bail!("line {line_no}: index {value} out of range ({pool_len} available)");
    }
    Ok(resolved as usize)
}

fn parse_corner(corner: &str, pools: &Pools, line_no: usize) -> Result<(usize, Option<usize>, Option<usize>)> {
    let mut fields = corner.split('/');
    let position = resolve_index(fields.next().unwrap_or(""), pools.positions.len(), line_no)?;
    let uv = match fields.next() {
        Some(raw) if !raw.is_empty() => Some(resolve_index(raw, pools.uvs.len(), line_no)?),
        _ => None,
    };
    let normal = match fields.next() {
        Some(raw) if !raw.is_empty() => Some(resolve_index(raw, pools.normals.len(), line_no)?),
        _ => None,
    };
    Ok((position, uv, normal))
}

/// `newmtl` names mapped to `Kd` (with `d` as alpha). Fetch or parse failures
/// only cost the colors.
fn load_material_library(
    libraries: &[String],
    ctx: &ParseContext<'_>,
    asset: &mut LoadedAsset,
) -> HashMap<String, [f32; 4]> {
    let mut colors = HashMap::new();
    for library in libraries {
        let bytes = match ctx.fetch_sibling(library) {
            Ok(bytes) => bytes,
            Err(err) => {
                asset.skip(format!("material library '{library}': {err}"));
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut current: Option<String> = None;
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("newmtl") => {
                    current = parts.next().map(str::to_string);
                    if let Some(name) = current.clone() {
                        colors.entry(name).or_insert([0.8, 0.8, 0.8, 1.0]);
                    }
                }
                Some("Kd") => {
                    let rgb: Vec<f32> = parts.filter_map(|p| p.parse().ok()).collect();
                    if let (Some(name), [r, g, b, ..]) = (current.as_ref(), rgb.as_slice()) {
                        if let Some(color) = colors.get_mut(name) {
                            color[..3].copy_from_slice(&[*r, *g, *b]);
                        }
                    }
                }
                Some("d") => {
                    let alpha = parts.next().and_then(|p| p.parse::<f32>().ok());
                    if let (Some(name), Some(alpha)) = (current.as_ref(), alpha) {
                        if let Some(color) = colors.get_mut(name) {
                            color[3] = alpha.clamp(0.0, 1.0);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    colors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AssetFormat;
    use crate::loaders::LoadToken;
    use crate::source::{AssetLocator, MemoryByteSource};

    fn parse_with(text: &str, source: &MemoryByteSource) -> Result<LoadedAsset> {
        let locator = AssetLocator::parse("models/part.obj");
        let token = LoadToken::new(1);
        let ctx =
            ParseContext { locator: &locator, format: AssetFormat::Obj, load_sequence: 7, source, token: &token };
        ObjLoader.parse(text.as_bytes(), &ctx)
    }

    #[test]
    fn quad_is_fan_triangulated() {
        let text = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n";
        let asset = parse_with(text, &MemoryByteSource::new()).expect("quad parses");
        assert_eq!(asset.tree.index_count(), 6);
        assert_eq!(asset.tree.vertex_count(), 4);
    }

    #[test]
    fn negative_indices_and_slashes() {
        let text = "v 0 0 0\nv 2 0 0\nv 0 2 0\nvt 0 0\nvn 0 0 1\nf -3/1/1 -2/1/1 -1//1\n";
        let asset = parse_with(text, &MemoryByteSource::new()).expect("relative indices parse");
        let item = &asset.tree.draw_items()[0];
        assert_eq!(item.geometry.vertex_count(), 3);
        assert!((item.geometry.bounds().size() - Vec3::new(2.0, 2.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn groups_become_children_and_unknown_statements_are_skipped() {
        let text = "v 0 0 0\nv 1 0 0\nv 0 1 0\nv 0 0 1\ncurv 0 1 1 2\ng a\nf 1 2 3\ng b\nf 1 2 4\n";
        let asset = parse_with(text, &MemoryByteSource::new()).expect("groups parse");
        assert_eq!(asset.tree.renderable_count(), 2);
        assert_eq!(asset.tree.roots().len(), 1);
        assert_eq!(asset.skipped.len(), 1);
        assert!(asset.skipped[0].contains("curv"));
    }

    #[test]
    fn material_library_colors_are_applied() {
        let source = MemoryByteSource::new();
        source.insert(AssetLocator::parse("models/part.mtl"), b"newmtl steel\nKd 0.2 0.3 0.4\n".to_vec());
        let text = "mtllib part.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl steel\nf 1 2 3\n";
        let asset = parse_with(text, &source).expect("obj with mtl parses");
        let material = asset.tree.draw_items()[0].material.snapshot();
        assert_eq!(material.base_color, [0.2, 0.3, 0.4, 1.0]);
    }

    #[test]
    fn missing_library_falls_back_to_default_color() {
        let text = "mtllib gone.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl x\nf 1 2 3\n";
        let asset = parse_with(text, &MemoryByteSource::new()).expect("obj parses without mtl");
        assert_eq!(asset.tree.draw_items()[0].material.snapshot().base_color, default_base_color(7, 0));
        assert!(asset.skipped.iter().any(|s| s.contains("gone.mtl")));
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let err = parse_with("v 0 0 0\nf 1 2 3\n", &MemoryByteSource::new()).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
