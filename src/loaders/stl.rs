use super::{AssetLoader, LoadedAsset, ParseContext};
use crate::geometry::{Geometry, Material, MaterialHandle, STL_DEFAULT_COLOR};
use crate::scene::{SceneArena, Transform};
use anyhow::{anyhow, bail, Context, Result};
use glam::Vec3;

const BINARY_HEADER_LEN: usize = 80;
const BINARY_TRIANGLE_LEN: usize = 50;

/// STL, binary or ASCII. The file's own color extensions are ignored and every
/// mesh gets [`STL_DEFAULT_COLOR`].
pub struct StlLoader;

impl AssetLoader for StlLoader {
    fn name(&self) -> &'static str {
        "stl"
    }

    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        let triangles = if is_binary(bytes) { parse_binary(bytes)? } else { parse_ascii(bytes)? };
        if triangles.is_empty() {
            bail!("STL contains no facets");
        }
        let mut positions = Vec::with_capacity(triangles.len() * 3);
        let mut normals = Vec::with_capacity(triangles.len() * 3);
        for (normal, corners) in &triangles {
            let face_normal = if normal.length_squared() > 0.0 {
                *normal
            } else {
                (corners[1] - corners[0]).cross(corners[2] - corners[0]).normalize_or_zero()
            };
            positions.extend_from_slice(corners);
            normals.extend_from_slice(&[face_normal; 3]);
        }
        let indices = (0..positions.len() as u32).collect();
        let geometry = Geometry::new(positions, Some(normals), None, indices).into_handle();
        let material = MaterialHandle::new(Material::new("stl", STL_DEFAULT_COLOR).double_sided(true));

        let mut tree = SceneArena::new();
        tree.add_mesh_node(None, Some("stl_mesh".into()), Transform::IDENTITY, geometry, material);
        Ok(LoadedAsset::new(ctx.format, tree))
    }
}

/// Binary files are recognized by their size matching the declared facet
/// count; an ASCII header alone is not trusted since exporters write "solid"
/// into binary headers too.
fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < BINARY_HEADER_LEN + 4 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = BINARY_HEADER_LEN + 4 + count * BINARY_TRIANGLE_LEN;
    if bytes.len() == expected {
        return true;
    }
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    !bytes[start..].starts_with(b"solid")
}

type Facet = (Vec3, [Vec3; 3]);

fn read_vec3(chunk: &[u8]) -> Vec3 {
    let f = |i: usize| f32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]]);
    Vec3::new(f(0), f(4), f(8))
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<Facet>> {
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let body = &bytes[BINARY_HEADER_LEN + 4..];
    if body.len() < count * BINARY_TRIANGLE_LEN {
        bail!("binary STL declares {count} facets but holds {} bytes", body.len());
    }
    Ok(body
        .chunks_exact(BINARY_TRIANGLE_LEN)
        .take(count)
        .map(|tri| {
            let corners = [read_vec3(&tri[12..24]), read_vec3(&tri[24..36]), read_vec3(&tri[36..48])];
            (read_vec3(&tri[0..12]), corners)
        })
        .collect())
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<Facet>> {
    let text = std::str::from_utf8(bytes).context("ASCII STL is not valid UTF-8")?;
    let mut facets = Vec::new();
    let mut normal = Vec3::ZERO;
    let mut corners: Vec<Vec3> = Vec::with_capacity(3);
    for (line_index, line) in text.lines().enumerate() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("facet") => {
                corners.clear();
                normal = if parts.next() == Some("normal") {
                    parse_xyz(&mut parts, line_index + 1)?
                } else {
                    Vec3::ZERO
                };
            }
            Some("vertex") => corners.push(parse_xyz(&mut parts, line_index + 1)?),
            Some("endfacet") => {
                let [a, b, c] = corners[..] else {
                    bail!("line {}: facet has {} vertices", line_index + 1, corners.len());
                };
                facets.push((normal, [a, b, c]));
                corners.clear();
            }
            _ => {}
        }
    }
    Ok(facets)
}

fn parse_xyz<'a>(parts: &mut impl Iterator<Item = &'a str>, line_no: usize) -> Result<Vec3> {
    let mut next = || -> Result<f32> {
        let token = parts.next().ok_or_else(|| anyhow!("line {line_no}: expected three coordinates"))?;
        token.parse().map_err(|_| anyhow!("line {line_no}: invalid coordinate '{token}'"))
    };
    Ok(Vec3::new(next()?, next()?, next()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::AssetFormat;
    use crate::loaders::LoadToken;
    use crate::source::{AssetLocator, MemoryByteSource};

    pub(crate) fn binary_triangle(corners: [[f32; 3]; 3]) -> Vec<u8> {
        let mut bytes = vec![b' '; BINARY_HEADER_LEN];
        bytes[..5].copy_from_slice(b"solid");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        for value in [0.0f32, 0.0, 1.0].iter().chain(corners.iter().flatten()) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes
    }

    fn parse(bytes: &[u8]) -> Result<LoadedAsset> {
        let locator = AssetLocator::parse("part.stl");
        let token = LoadToken::new(1);
        let source = MemoryByteSource::new();
        let ctx = ParseContext {
            locator: &locator,
            format: AssetFormat::Stl,
            load_sequence: 0,
            source: &source,
            token: &token,
        };
        StlLoader.parse(bytes, &ctx)
    }

    #[test]
    fn binary_with_solid_header_is_detected_by_size() {
        let asset = parse(&binary_triangle([[0.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 2.0, 2.0]]))
            .expect("binary stl parses");
        assert_eq!(asset.tree.vertex_count(), 3);
        assert!((asset.tree.aggregate_bounds().size() - Vec3::splat(2.0)).length() < 1e-6);
    }

    #[test]
    fn ascii_facets_parse_with_fixed_color() {
        let text = "solid t\n facet normal 0 0 1\n  outer loop\n   vertex 0 0 0\n   vertex 1 0 0\n   vertex 0 1 0\n  endloop\n endfacet\nendsolid t\n";
        let asset = parse(text.as_bytes()).expect("ascii stl parses");
        let item = &asset.tree.draw_items()[0];
        assert_eq!(item.geometry.triangle_count(), 1);
        assert_eq!(item.material.snapshot().base_color, STL_DEFAULT_COLOR);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut bytes = binary_triangle([[0.0; 3]; 3]);
        bytes[80] = 9;
        bytes.truncate(120);
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn empty_solid_is_rejected() {
        let err = parse(b"solid empty\nendsolid empty\n").unwrap_err();
        assert!(err.to_string().contains("no facets"));
    }
}
