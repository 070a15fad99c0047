use super::{AssetLoader, LoadedAsset, ParseContext};
use crate::geometry::{default_base_color, Geometry, Material, MaterialHandle};
use crate::scene::{SceneArena, Transform};
use anyhow::{anyhow, bail, Context, Result};
use glam::{Vec2, Vec3};

/// Stanford PLY in any of its three encodings. Vertex colors, when present,
/// are averaged into a single base color.
pub struct PlyLoader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            other => bail!("unknown PLY property type '{other}'"),
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Scalar::F32 | Scalar::F64)
    }
}

#[derive(Clone, Debug)]
enum PropertyKind {
    Scalar(Scalar),
    List { count: Scalar, item: Scalar },
}

#[derive(Clone, Debug)]
struct Property {
    name: String,
    kind: PropertyKind,
}

#[derive(Clone, Debug)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
    body_offset: usize,
}

fn parse_header(bytes: &[u8]) -> Result<Header> {
    let marker = b"end_header";
    let end = bytes
        .windows(marker.len())
        .position(|window| window == marker)
        .ok_or_else(|| anyhow!("PLY header has no end_header"))?;
    let body_offset = bytes[end..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|newline| end + newline + 1)
        .unwrap_or(bytes.len());
    let text = std::str::from_utf8(&bytes[..end]).context("PLY header is not valid UTF-8")?;
    let mut lines = text.lines().map(str::trim);
    if lines.next() != Some("ply") {
        bail!("missing 'ply' magic");
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] | ["comment", ..] | ["obj_info", ..] => {}
            ["format", kind, _version] => {
                encoding = Some(match *kind {
                    "ascii" => Encoding::Ascii,
                    "binary_little_endian" => Encoding::BinaryLittleEndian,
                    "binary_big_endian" => Encoding::BinaryBigEndian,
                    other => bail!("unknown PLY encoding '{other}'"),
                });
            }
            ["element", name, count] => elements.push(Element {
                name: name.to_string(),
                count: count.parse().with_context(|| format!("bad element count '{count}'"))?,
                properties: Vec::new(),
            }),
            ["property", "list", count, item, name] => {
                let element = elements.last_mut().ok_or_else(|| anyhow!("property before any element"))?;
                element.properties.push(Property {
                    name: name.to_string(),
                    kind: PropertyKind::List { count: Scalar::parse(count)?, item: Scalar::parse(item)? },
                });
            }
            ["property", ty, name] => {
                let element = elements.last_mut().ok_or_else(|| anyhow!("property before any element"))?;
                element.properties.push(Property { name: name.to_string(), kind: PropertyKind::Scalar(Scalar::parse(ty)?) });
            }
            _ => bail!("unrecognized PLY header line '{line}'"),
        }
    }
    let encoding = encoding.ok_or_else(|| anyhow!("PLY header has no format line"))?;
    Ok(Header { encoding, elements, body_offset })
}

enum Body<'a> {
    Ascii(std::str::SplitAsciiWhitespace<'a>),
    Binary { bytes: &'a [u8], pos: usize, big_endian: bool },
}

impl<'a> Body<'a> {
    fn new(encoding: Encoding, bytes: &'a [u8]) -> Result<Self> {
        Ok(match encoding {
            Encoding::Ascii => {
                Body::Ascii(std::str::from_utf8(bytes).context("ASCII PLY body is not valid UTF-8")?.split_ascii_whitespace())
            }
            Encoding::BinaryLittleEndian => Body::Binary { bytes, pos: 0, big_endian: false },
            Encoding::BinaryBigEndian => Body::Binary { bytes, pos: 0, big_endian: true },
        })
    }

    fn read(&mut self, ty: Scalar) -> Result<f64> {
        match self {
            Body::Ascii(tokens) => {
                let token = tokens.next().ok_or_else(|| anyhow!("PLY body ended early"))?;
                token.parse::<f64>().map_err(|_| anyhow!("invalid PLY value '{token}'"))
            }
            Body::Binary { bytes, pos, big_endian } => {
                let size = ty.size();
                let raw = bytes.get(*pos..*pos + size).ok_or_else(|| anyhow!("PLY body ended early"))?;
                *pos += size;
                let mut buf = [0u8; 8];
                buf[..size].copy_from_slice(raw);
                if *big_endian {
                    buf[..size].reverse();
                }
                let [b0, b1, b2, b3, ..] = buf;
                Ok(match ty {
                    Scalar::I8 => b0 as i8 as f64,
                    Scalar::U8 => b0 as f64,
                    Scalar::I16 => i16::from_le_bytes([b0, b1]) as f64,
                    Scalar::U16 => u16::from_le_bytes([b0, b1]) as f64,
                    Scalar::I32 => i32::from_le_bytes([b0, b1, b2, b3]) as f64,
                    Scalar::U32 => u32::from_le_bytes([b0, b1, b2, b3]) as f64,
                    Scalar::F32 => f32::from_le_bytes([b0, b1, b2, b3]) as f64,
                    Scalar::F64 => f64::from_le_bytes(buf),
                })
            }
        }
    }
}

#[derive(Default)]
struct VertexSlots {
    position: [Option<usize>; 3],
    normal: [Option<usize>; 3],
    uv: [Option<usize>; 2],
    color: [Option<(usize, Scalar)>; 3],
}

impl VertexSlots {
    fn from_element(element: &Element) -> Self {
        let mut slots = VertexSlots::default();
        for (index, property) in element.properties.iter().enumerate() {
            let PropertyKind::Scalar(ty) = property.kind else {
                continue;
            };
            match property.name.as_str() {
                "x" => slots.position[0] = Some(index),
                "y" => slots.position[1] = Some(index),
                "z" => slots.position[2] = Some(index),
                "nx" => slots.normal[0] = Some(index),
                "ny" => slots.normal[1] = Some(index),
                "nz" => slots.normal[2] = Some(index),
                "u" | "s" | "texture_u" => slots.uv[0] = Some(index),
                "v" | "t" | "texture_v" => slots.uv[1] = Some(index),
                "red" | "r" => slots.color[0] = Some((index, ty)),
                "green" | "g" => slots.color[1] = Some((index, ty)),
                "blue" | "b" => slots.color[2] = Some((index, ty)),
                _ => {}
            }
        }
        slots
    }
}

impl AssetLoader for PlyLoader {
    fn name(&self) -> &'static str {
        "ply"
    }

    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        let header = parse_header(bytes)?;
        let mut body = Body::new(header.encoding, &bytes[header.body_offset..])?;
        let mut asset = LoadedAsset::new(ctx.format, SceneArena::new());

        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut uvs = Vec::new();
        let mut color_sum = Vec3::ZERO;
        let mut color_samples = 0usize;
        let mut indices: Vec<u32> = Vec::new();
        let mut vertex_seen = false;

        for element in &header.elements {
            let slots = VertexSlots::from_element(element);
            let is_vertex = element.name == "vertex";
            let is_face = element.name == "face";
            if is_vertex {
                if slots.position.iter().any(Option::is_none) {
                    bail!("PLY vertex element lacks x/y/z");
                }
                vertex_seen = true;
            } else if !is_face {
                asset.skip(format!("element '{}' ({} entries)", element.name, element.count));
            }

            let mut scalars = vec![0.0f64; element.properties.len()];
            for _ in 0..element.count {
                ctx.token.check().map_err(|err| anyhow!("{err}"))?;
                for (index, property) in element.properties.iter().enumerate() {
                    match property.kind {
                        PropertyKind::Scalar(ty) => scalars[index] = body.read(ty)?,
                        PropertyKind::List { count, item } => {
                            let len = body.read(count)?;
                            if len < 0.0 {
                                bail!("negative PLY list length");
                            }
                            let items = (0..len as usize).map(|_| body.read(item)).collect::<Result<Vec<f64>>>()?;
                            let face_list = matches!(property.name.as_str(), "vertex_indices" | "vertex_index");
                            if is_face && face_list {
                                fan_triangulate(&items, &mut indices, &mut asset)?;
                            }
                        }
                    }
                }
                if is_vertex {
                    let get = |slot: Option<usize>| slot.map(|i| scalars[i] as f32).unwrap_or(0.0);
                    positions.push(Vec3::new(get(slots.position[0]), get(slots.position[1]), get(slots.position[2])));
                    if slots.normal.iter().all(Option::is_some) {
                        normals.push(Vec3::new(get(slots.normal[0]), get(slots.normal[1]), get(slots.normal[2])));
                    }
                    if slots.uv.iter().all(Option::is_some) {
                        uvs.push(Vec2::new(get(slots.uv[0]), get(slots.uv[1])));
                    }
                    if let [Some(r), Some(g), Some(b)] = slots.color {
                        let channel = |(i, ty): (usize, Scalar)| {
                            if ty.is_float() { scalars[i] as f32 } else { scalars[i] as f32 / 255.0 }
                        };
                        color_sum += Vec3::new(channel(r), channel(g), channel(b));
                        color_samples += 1;
                    }
                }
            }
        }

        if !vertex_seen {
            bail!("PLY has no vertex element");
        }
        if let Some(bad) = indices.iter().find(|i| **i as usize >= positions.len()) {
            bail!("face index {bad} out of range for {} vertices", positions.len());
        }
        if indices.is_empty() {
            // Point clouds carry no faces to draw.
            bail!("PLY has no faces");
        }

        let base_color = if color_samples > 0 {
            let mean = (color_sum / color_samples as f32).clamp(Vec3::ZERO, Vec3::ONE);
            [mean.x, mean.y, mean.z, 1.0]
        } else {
            default_base_color(ctx.load_sequence, 0)
        };
        let normals = (!normals.is_empty()).then_some(normals);
        let uvs = (!uvs.is_empty()).then_some(uvs);
        let geometry = Geometry::new(positions, normals, uvs, indices).into_handle();
        let material = MaterialHandle::new(Material::new("ply", base_color));
        asset.tree.add_mesh_node(None, Some("ply_mesh".into()), Transform::IDENTITY, geometry, material);
        Ok(asset)
    }
}

fn fan_triangulate(items: &[f64], indices: &mut Vec<u32>, asset: &mut LoadedAsset) -> Result<()> {
    if items.len() < 3 {
        asset.skip(format!("face with {} corners", items.len()));
        return Ok(());
    }
    if let Some(bad) = items.iter().find(|v| **v < 0.0 || **v > u32::MAX as f64) {
        bail!("PLY face index {bad} is not a valid vertex index");
    }
    let corner = |i: usize| items[i] as u32;
    for i in 1..items.len() - 1 {
        indices.extend_from_slice(&[corner(0), corner(i), corner(i + 1)]);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::AssetFormat;
    use crate::loaders::LoadToken;
    use crate::source::{AssetLocator, MemoryByteSource};

    pub(crate) const ASCII_QUAD: &str = "ply\nformat ascii 1.0\ncomment unit quad\nelement vertex 4\nproperty float x\nproperty float y\nproperty float z\nproperty uchar red\nproperty uchar green\nproperty uchar blue\nelement face 1\nproperty list uchar int vertex_indices\nend_header\n0 0 0 255 0 0\n1 0 0 255 0 0\n1 1 0 0 0 255\n0 1 0 0 0 255\n4 0 1 2 3\n";

    pub(crate) fn binary_triangle(big_endian: bool) -> Vec<u8> {
        let format = if big_endian { "binary_big_endian" } else { "binary_little_endian" };
        let header = format!(
            "ply\nformat {format} 1.0\nelement vertex 3\nproperty float x\nproperty float y\nproperty float z\nelement face 1\nproperty list uchar uint vertex_index\nend_header\n"
        );
        let mut bytes = header.into_bytes();
        for value in [0.0f32, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 3.0, 0.0] {
            bytes.extend_from_slice(&if big_endian { value.to_be_bytes() } else { value.to_le_bytes() });
        }
        bytes.push(3);
        for index in [0u32, 1, 2] {
            bytes.extend_from_slice(&if big_endian { index.to_be_bytes() } else { index.to_le_bytes() });
        }
        bytes
    }

    fn parse(bytes: &[u8]) -> Result<LoadedAsset> {
        let locator = AssetLocator::parse("scan.ply");
        let token = LoadToken::new(1);
        let source = MemoryByteSource::new();
        let ctx = ParseContext {
            locator: &locator,
            format: AssetFormat::Ply,
            load_sequence: 2,
            source: &source,
            token: &token,
        };
        PlyLoader.parse(bytes, &ctx)
    }

    #[test]
    fn ascii_quad_is_fan_triangulated_and_colors_averaged() {
        let asset = parse(ASCII_QUAD.as_bytes()).expect("ascii ply parses");
        let item = &asset.tree.draw_items()[0];
        assert_eq!(item.geometry.triangle_count(), 2);
        let color = item.material.snapshot().base_color;
        assert!((color[0] - 0.5).abs() < 1e-6);
        assert!(color[1].abs() < 1e-6);
        assert!((color[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn both_binary_encodings_agree() {
        for big_endian in [false, true] {
            let asset = parse(&binary_triangle(big_endian)).expect("binary ply parses");
            let bounds = asset.tree.aggregate_bounds();
            assert_eq!(bounds.max, Vec3::new(3.0, 3.0, 0.0), "big_endian={big_endian}");
            assert_eq!(asset.tree.index_count(), 3);
        }
    }

    #[test]
    fn colorless_ply_gets_the_default_color() {
        let asset = parse(&binary_triangle(false)).expect("binary ply parses");
        let color = asset.tree.draw_items()[0].material.snapshot().base_color;
        assert_eq!(color, default_base_color(2, 0));
    }

    #[test]
    fn out_of_range_face_is_rejected() {
        let text = ASCII_QUAD.replace("4 0 1 2 3", "3 0 1 9");
        let err = parse(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn negative_face_index_is_rejected() {
        let text = ASCII_QUAD.replace("4 0 1 2 3", "3 0 -1 2");
        let err = parse(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("face index -1"), "{err:#}");
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut bytes = binary_triangle(false);
        bytes.truncate(bytes.len() - 5);
        assert!(parse(&bytes).is_err());
    }
}
