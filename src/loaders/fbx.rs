use super::{AssetLoader, LoadedAsset, ParseContext};
use crate::geometry::{default_base_color, Geometry, Material, MaterialHandle};
use crate::scene::{NodeId, SceneArena, Transform};
use anyhow::{anyhow, bail, Context, Result};
use flate2::read::ZlibDecoder;
use glam::{EulerRot, Quat, Vec3};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::io::Read;

const MAGIC: &[u8] = b"Kaydara FBX Binary  \0";
const HEADER_LEN: usize = 27;
/// Versions from 7.5 on widen record offsets to 64 bits.
const WIDE_OFFSET_VERSION: u32 = 7500;
const MAX_DEPTH: usize = 64;
const SKIPPED_OBJECTS: &[&str] = &[
    "Deformer",
    "AnimationStack",
    "AnimationLayer",
    "AnimationCurve",
    "AnimationCurveNode",
    "Texture",
    "Video",
    "Pose",
];

/// Binary FBX (7.x). Reads mesh geometry, model transforms and diffuse colors;
/// animation, skinning and textures are reported as skipped.
pub struct FbxLoader;

#[derive(Clone, Debug, PartialEq)]
enum Property {
    Int(i64),
    Float(f64),
    Str(String),
    Raw,
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

impl Property {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Property::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Property::Float(v) => Some(*v),
            Property::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Property::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct FbxNode {
    name: String,
    properties: Vec<Property>,
    children: Vec<FbxNode>,
}

impl FbxNode {
    fn child(&self, name: &str) -> Option<&FbxNode> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FbxNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn id(&self) -> Option<i64> {
        self.properties.first().and_then(Property::as_i64)
    }

    /// Object names are stored as "Name\0\x01Class".
    fn object_name(&self) -> Option<String> {
        let raw = self.properties.get(1)?.as_str()?;
        let name = raw.split("\u{0}\u{1}").next().unwrap_or(raw);
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Looks up a `Properties70` entry and returns its numeric payload.
    fn p70(&self, key: &str) -> Option<Vec<f64>> {
        let props = self.child("Properties70")?;
        props
            .children_named("P")
            .find(|p| p.properties.first().and_then(Property::as_str) == Some(key))
            .map(|p| p.properties.iter().skip(4).filter_map(Property::as_f64).collect())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or_else(|| anyhow!("FBX record runs past end of file at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn offset(&mut self, wide: bool) -> Result<u64> {
        if wide {
            Ok(u64::from_le_bytes(self.array()?))
        } else {
            Ok(self.u32()? as u64)
        }
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let pos = usize::try_from(pos).ok().filter(|p| *p <= self.bytes.len());
        self.pos = pos.ok_or_else(|| anyhow!("FBX record offset out of range"))?;
        Ok(())
    }
}

fn read_document(bytes: &[u8]) -> Result<(u32, Vec<FbxNode>)> {
    if !bytes.starts_with(MAGIC) {
        if bytes.iter().take(64).all(|b| b.is_ascii()) {
            bail!("ASCII FBX is not supported; re-export as binary");
        }
        bail!("missing FBX binary magic");
    }
    if bytes.len() < HEADER_LEN {
        bail!("FBX header truncated");
    }
    let version = u32::from_le_bytes([bytes[23], bytes[24], bytes[25], bytes[26]]);
    let wide = version >= WIDE_OFFSET_VERSION;
    let mut cursor = Cursor { bytes, pos: HEADER_LEN };
    let mut nodes = Vec::new();
    while let Some(node) = read_node(&mut cursor, wide, 0)? {
        nodes.push(node);
    }
    Ok((version, nodes))
}

fn read_node(cursor: &mut Cursor<'_>, wide: bool, depth: usize) -> Result<Option<FbxNode>> {
    if depth > MAX_DEPTH {
        bail!("FBX nesting deeper than {MAX_DEPTH}");
    }
    let start = cursor.pos;
    let end = cursor.offset(wide)?;
    let property_count = cursor.offset(wide)?;
    let property_bytes = cursor.offset(wide)?;
    let name_len = cursor.u8()? as usize;
    if end == 0 {
        return Ok(None);
    }
    if end <= start as u64 || end > cursor.bytes.len() as u64 {
        bail!("FBX record at offset {start} has invalid end offset {end}");
    }
    let name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();

    let properties_start = cursor.pos as u64;
    let mut properties = Vec::new();
    for _ in 0..property_count {
        properties.push(read_property(cursor).with_context(|| format!("in record '{name}'"))?);
    }
    cursor.seek(properties_start + property_bytes)?;

    let mut children = Vec::new();
    while (cursor.pos as u64) < end {
        match read_node(cursor, wide, depth + 1)? {
            Some(child) => children.push(child),
            None => break,
        }
    }
    cursor.seek(end)?;
    Ok(Some(FbxNode { name, properties, children }))
}

fn read_property(cursor: &mut Cursor<'_>) -> Result<Property> {
    let code = cursor.u8()?;
    Ok(match code {
        b'Y' => Property::Int(i16::from_le_bytes(cursor.array()?) as i64),
        b'C' => Property::Int((cursor.u8()? != 0) as i64),
        b'I' => Property::Int(i32::from_le_bytes(cursor.array()?) as i64),
        b'L' => Property::Int(i64::from_le_bytes(cursor.array()?)),
        b'F' => Property::Float(f32::from_le_bytes(cursor.array()?) as f64),
        b'D' => Property::Float(f64::from_le_bytes(cursor.array()?)),
        b'S' => {
            let len = cursor.u32()? as usize;
            Property::Str(String::from_utf8_lossy(cursor.take(len)?).into_owned())
        }
        b'R' => {
            let len = cursor.u32()? as usize;
            cursor.take(len)?;
            Property::Raw
        }
        b'f' => Property::FloatArray(
            read_array(cursor, 4)?.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64).collect(),
        ),
        b'd' => Property::FloatArray(
            read_array(cursor, 8)?
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        b'i' => Property::IntArray(
            read_array(cursor, 4)?.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64).collect(),
        ),
        b'l' => Property::IntArray(
            read_array(cursor, 8)?
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        b'b' => Property::IntArray(read_array(cursor, 1)?.iter().map(|b| (*b != 0) as i64).collect()),
        other => bail!("unknown FBX property type 0x{other:02x}"),
    })
}

/// Array payloads are raw or zlib-deflated (encoding 1).
fn read_array<'a>(cursor: &mut Cursor<'a>, element_size: usize) -> Result<Cow<'a, [u8]>> {
    let len = cursor.u32()? as usize;
    let encoding = cursor.u32()?;
    let stored = cursor.u32()? as usize;
    let raw = cursor.take(stored)?;
    let expected = len.checked_mul(element_size).ok_or_else(|| anyhow!("FBX array length overflows"))?;
    let data = match encoding {
        0 => Cow::Borrowed(raw),
        1 => {
            // The header states the inflated size; one byte past it is enough
            // to tell that the stream is longer.
            let mut out = Vec::with_capacity(expected.min(64 * 1024 * 1024));
            ZlibDecoder::new(raw)
                .take(expected as u64 + 1)
                .read_to_end(&mut out)
                .context("FBX array failed to inflate")?;
            if out.len() != expected {
                bail!("FBX array inflated to {} bytes, expected {expected}", out.len());
            }
            Cow::Owned(out)
        }
        other => bail!("unknown FBX array encoding {other}"),
    };
    if data.len() < expected {
        bail!("FBX array holds {} bytes, expected {expected}", data.len());
    }
    Ok(match data {
        Cow::Borrowed(slice) => Cow::Borrowed(&slice[..expected]),
        Cow::Owned(mut vec) => {
            vec.truncate(expected);
            Cow::Owned(vec)
        }
    })
}

struct MeshData {
    positions: Vec<Vec3>,
    indices: Vec<u32>,
}

fn read_mesh(geometry: &FbxNode) -> Result<MeshData> {
    let vertices = match geometry.child("Vertices").and_then(|v| v.properties.first()) {
        Some(Property::FloatArray(values)) => values,
        _ => bail!("geometry has no Vertices array"),
    };
    let polygon_indices = match geometry.child("PolygonVertexIndex").and_then(|v| v.properties.first()) {
        Some(Property::IntArray(values)) => values,
        _ => bail!("geometry has no PolygonVertexIndex array"),
    };
    let positions: Vec<Vec3> =
        vertices.chunks_exact(3).map(|c| Vec3::new(c[0] as f32, c[1] as f32, c[2] as f32)).collect();

    let mut indices = Vec::new();
    let mut polygon: Vec<u32> = Vec::new();
    for raw in polygon_indices {
        // A negative index closes the polygon and is stored bit-inverted.
        let (index, closes) = if *raw < 0 { (!*raw, true) } else { (*raw, false) };
        if index as usize >= positions.len() {
            bail!("polygon index {index} out of range for {} vertices", positions.len());
        }
        polygon.push(index as u32);
        if closes {
            for i in 1..polygon.len().saturating_sub(1) {
                indices.extend_from_slice(&[polygon[0], polygon[i], polygon[i + 1]]);
            }
            polygon.clear();
        }
    }
    Ok(MeshData { positions, indices })
}

fn model_transform(model: &FbxNode) -> Transform {
    let vec3 = |key: &str, fallback: Vec3| {
        model
            .p70(key)
            .filter(|v| v.len() >= 3)
            .map(|v| Vec3::new(v[0] as f32, v[1] as f32, v[2] as f32))
            .unwrap_or(fallback)
    };
    let translation = vec3("Lcl Translation", Vec3::ZERO);
    let rotation = vec3("Lcl Rotation", Vec3::ZERO);
    let scale = vec3("Lcl Scaling", Vec3::ONE);
    // Default rotation order applies X, then Y, then Z.
    let rotation = Quat::from_euler(
        EulerRot::ZYX,
        rotation.z.to_radians(),
        rotation.y.to_radians(),
        rotation.x.to_radians(),
    );
    Transform { translation, rotation, scale }
}

/// Object-to-object links from the `Connections` section.
struct Links {
    /// Child to parents.
    parents: HashMap<i64, Vec<i64>>,
    /// `(child, parent)` in file order.
    ordered: Vec<(i64, i64)>,
}

impl Links {
    fn get(&self, child: &i64) -> Option<&Vec<i64>> {
        self.parents.get(child)
    }

    /// Children linked to `parent`, in file order.
    fn children_of(&self, parent: i64) -> impl Iterator<Item = i64> + '_ {
        self.ordered.iter().filter(move |(_, p)| *p == parent).map(|(child, _)| *child)
    }
}

fn read_connections(document: &[FbxNode]) -> Links {
    let mut links = Links { parents: HashMap::new(), ordered: Vec::new() };
    let Some(connections) = document.iter().find(|n| n.name == "Connections") else {
        return links;
    };
    for link in connections.children_named("C") {
        let kind = link.properties.first().and_then(Property::as_str);
        let child = link.properties.get(1).and_then(Property::as_i64);
        let parent = link.properties.get(2).and_then(Property::as_i64);
        if let (Some("OO" | "OP"), Some(child), Some(parent)) = (kind, child, parent) {
            links.parents.entry(child).or_default().push(parent);
            links.ordered.push((child, parent));
        }
    }
    links
}

struct Builder<'a> {
    models: HashMap<i64, &'a FbxNode>,
    links: &'a Links,
    placed: HashMap<i64, NodeId>,
    tree: SceneArena,
}

impl Builder<'_> {
    fn parent_model(&self, id: i64) -> Option<i64> {
        self.links.get(&id)?.iter().copied().find(|parent| self.models.contains_key(parent))
    }

    /// Places a model node, placing its ancestors first.
    fn place_model(&mut self, id: i64, visiting: &mut HashSet<i64>) -> Option<NodeId> {
        if let Some(node) = self.placed.get(&id) {
            return Some(*node);
        }
        let model = *self.models.get(&id)?;
        if !visiting.insert(id) || visiting.len() > MAX_DEPTH {
            return None;
        }
        let parent = self.parent_model(id).and_then(|parent| self.place_model(parent, visiting));
        let node = self.tree.add_node(parent, model.object_name(), model_transform(model));
        self.placed.insert(id, node);
        Some(node)
    }
}

impl AssetLoader for FbxLoader {
    fn name(&self) -> &'static str {
        "fbx"
    }

    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        let (version, document) = read_document(bytes)?;
        log::debug!("[loader] fbx version {version}, {} top-level records", document.len());
        let mut asset = LoadedAsset::new(ctx.format, SceneArena::new());
        let objects = document.iter().find(|n| n.name == "Objects").ok_or_else(|| anyhow!("FBX has no Objects section"))?;
        let links = read_connections(&document);

        let models: HashMap<i64, &FbxNode> =
            objects.children_named("Model").filter_map(|m| Some((m.id()?, m))).collect();
        let mut diffuse: HashMap<i64, [f32; 4]> = HashMap::new();
        for material in objects.children_named("Material") {
            let color = material.p70("DiffuseColor").or_else(|| material.p70("Diffuse")).filter(|c| c.len() >= 3);
            if let (Some(id), Some(c)) = (material.id(), color) {
                diffuse.insert(id, [c[0] as f32, c[1] as f32, c[2] as f32, 1.0]);
            }
        }
        let mut skipped_kinds: HashMap<&str, usize> = HashMap::new();
        for object in &objects.children {
            if SKIPPED_OBJECTS.contains(&object.name.as_str()) {
                *skipped_kinds.entry(object.name.as_str()).or_default() += 1;
            }
        }
        for (kind, count) in skipped_kinds {
            asset.skip(format!("{count} {kind} object(s)"));
        }

        let mut builder = Builder { models, links: &links, placed: HashMap::new(), tree: SceneArena::new() };
        let mut slot = 0u32;
        for geometry in objects.children_named("Geometry") {
            let kind = geometry.properties.get(2).and_then(Property::as_str).unwrap_or("Mesh");
            if kind != "Mesh" {
                asset.skip(format!("geometry of kind '{kind}'"));
                continue;
            }
            let mesh = match read_mesh(geometry) {
                Ok(mesh) => mesh,
                Err(err) => {
                    asset.skip(format!("geometry '{}': {err}", geometry.object_name().unwrap_or_default()));
                    continue;
                }
            };
            if mesh.indices.is_empty() {
                asset.skip(format!("geometry '{}' without polygons", geometry.object_name().unwrap_or_default()));
                continue;
            }
            let owner = geometry.id().and_then(|id| links.get(&id)).and_then(|parents| {
                parents.iter().copied().find(|parent| builder.models.contains_key(parent))
            });
            let parent = owner.and_then(|id| builder.place_model(id, &mut HashSet::new()));
            let color = owner
                .and_then(|model| links.children_of(model).find_map(|child| diffuse.get(&child).copied()))
                .unwrap_or_else(|| {
                    let color = default_base_color(ctx.load_sequence, slot);
                    slot += 1;
                    color
                });
            let name = geometry.object_name().or_else(|| Some("fbx_mesh".to_string()));
            let geometry = Geometry::new(mesh.positions, None, None, mesh.indices).into_handle();
            let material = MaterialHandle::new(Material::new("fbx", color));
            builder.tree.add_mesh_node(parent, name, Transform::IDENTITY, geometry, material);
        }
        asset.tree = builder.tree;
        Ok(asset)
    }
}
