use super::{AssetLoader, LoadError, LoadedAsset, ParseContext};
use crate::geometry::{default_base_color, Geometry, Material, MaterialHandle};
use crate::scene::{NodeId, SceneArena, Transform};
use anyhow::{anyhow, bail, Result};
use base64::Engine as _;
use glam::{Quat, Vec2, Vec3};
use gltf::mesh::Mode;
use std::collections::HashMap;

/// glTF 2.0, both the JSON (`.gltf`) and binary (`.glb`) containers.
pub struct GltfLoader;

impl AssetLoader for GltfLoader {
    fn name(&self) -> &'static str {
        "gltf"
    }

    fn parse(&self, bytes: &[u8], ctx: &ParseContext<'_>) -> Result<LoadedAsset> {
        let gltf::Gltf { document, blob } = gltf::Gltf::from_slice(bytes)?;
        let buffers = resolve_buffers(&document, blob, ctx)?;

        let mut asset = LoadedAsset::new(ctx.format, SceneArena::new());
        let mut builder = TreeBuilder { buffers: &buffers, ctx, materials: HashMap::new(), default_slot: 0 };

        let scene = document.default_scene().or_else(|| document.scenes().next());
        match scene {
            Some(scene) => {
                for node in scene.nodes() {
                    builder.add_node(&mut asset, None, node, 0)?;
                }
            }
            None => {
                // No scene list: fall back to every mesh at the origin.
                for mesh in document.meshes() {
                    let parent =
                        asset.tree.add_node(None, mesh.name().map(str::to_string), Transform::IDENTITY);
                    builder.add_mesh(&mut asset, parent, mesh)?;
                }
            }
        }
        Ok(asset)
    }
}

const MAX_NODE_DEPTH: usize = 256;

struct TreeBuilder<'a, 'c> {
    buffers: &'a [Vec<u8>],
    ctx: &'a ParseContext<'c>,
    materials: HashMap<usize, MaterialHandle>,
    default_slot: u32,
}

impl TreeBuilder<'_, '_> {
    fn add_node(
        &mut self,
        asset: &mut LoadedAsset,
        parent: Option<NodeId>,
        node: gltf::Node<'_>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_NODE_DEPTH {
            asset.skip(format!("node {} nested deeper than {MAX_NODE_DEPTH} levels", node.index()));
            return Ok(());
        }
        let (translation, rotation, scale) = node.transform().decomposed();
        let transform = Transform {
            translation: Vec3::from_array(translation),
            rotation: Quat::from_array(rotation),
            scale: Vec3::from_array(scale),
        };
        let name = node.name().map(str::to_string).or_else(|| Some(format!("node_{}", node.index())));
        let id = asset.tree.add_node(parent, name, transform);
        if node.camera().is_some() {
            asset.skip(format!("camera on node {}", node.index()));
        }
        if node.skin().is_some() {
            asset.skip(format!("skin on node {} (rendered in bind pose)", node.index()));
        }
        if let Some(mesh) = node.mesh() {
            self.add_mesh(asset, id, mesh)?;
        }
        for child in node.children() {
            self.add_node(asset, Some(id), child, depth + 1)?;
        }
        Ok(())
    }

    fn add_mesh(&mut self, asset: &mut LoadedAsset, parent: NodeId, mesh: gltf::Mesh<'_>) -> Result<()> {
        for (primitive_index, primitive) in mesh.primitives().enumerate() {
            if primitive.mode() != Mode::Triangles {
                asset.skip(format!(
                    "primitive {primitive_index} of mesh {} uses {:?} topology",
                    mesh.index(),
                    primitive.mode()
                ));
                continue;
            }
            let buffers = self.buffers;
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(Vec::as_slice));
            let Some(positions_iter) = reader.read_positions() else {
                asset.skip(format!("primitive {primitive_index} of mesh {} has no POSITION", mesh.index()));
                continue;
            };
            let positions: Vec<Vec3> = positions_iter.map(Vec3::from_array).collect();
            if positions.is_empty() {
                continue;
            }
            let normals: Option<Vec<Vec3>> = reader.read_normals().map(|it| it.map(Vec3::from_array).collect());
            let uvs: Option<Vec<Vec2>> =
                reader.read_tex_coords(0).map(|coords| coords.into_f32().map(Vec2::from_array).collect());
            let indices: Vec<u32> = reader
                .read_indices()
                .map(|read| read.into_u32().collect())
                .unwrap_or_else(|| (0..positions.len() as u32).collect());
            if let Some(bad) = indices.iter().find(|idx| **idx as usize >= positions.len()) {
                asset.skip(format!(
                    "primitive {primitive_index} of mesh {}: index {bad} out of range for {} vertices",
                    mesh.index(),
                    positions.len()
                ));
                continue;
            }

            let material = self.material_for(&primitive);
            let geometry = Geometry::new(positions, normals, uvs, indices).into_handle();
            let name = mesh
                .name()
                .map(|mesh_name| format!("{mesh_name}::{primitive_index}"))
                .unwrap_or_else(|| format!("mesh_{}::{primitive_index}", mesh.index()));
            asset.tree.add_mesh_node(Some(parent), Some(name), Transform::IDENTITY, geometry, material);
        }
        Ok(())
    }

    fn material_for(&mut self, primitive: &gltf::Primitive<'_>) -> MaterialHandle {
        let material = primitive.material();
        match material.index() {
            Some(index) => self
                .materials
                .entry(index)
                .or_insert_with(|| {
                    let label = material.name().map(str::to_string).unwrap_or_else(|| format!("material_{index}"));
                    let color = material.pbr_metallic_roughness().base_color_factor();
                    MaterialHandle::new(Material::new(label, color).double_sided(material.double_sided()))
                })
                .clone(),
            None => {
                let slot = self.default_slot;
                self.default_slot += 1;
                MaterialHandle::new(Material::new("default", default_base_color(self.ctx.load_sequence, slot)))
            }
        }
    }
}

fn resolve_buffers(
    document: &gltf::Document,
    mut blob: Option<Vec<u8>>,
    ctx: &ParseContext<'_>,
) -> Result<Vec<Vec<u8>>> {
    let mut buffers = Vec::new();
    for buffer in document.buffers() {
        let mut data = match buffer.source() {
            gltf::buffer::Source::Bin => blob.take().ok_or_else(|| anyhow!("GLB binary chunk missing"))?,
            gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => decode_data_uri(uri)?,
            gltf::buffer::Source::Uri(uri) => match ctx.fetch_sibling(uri) {
                Ok(bytes) => bytes,
                Err(LoadError::Cancelled) => bail!("load cancelled"),
                Err(LoadError::Failed(err)) => bail!("external buffer '{uri}': {err}"),
            },
        };
        if data.len() < buffer.length() {
            bail!("buffer {} is {} bytes, expected {}", buffer.index(), data.len(), buffer.length());
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }
        buffers.push(data);
    }
    Ok(buffers)
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let (header, payload) = uri.split_once(',').ok_or_else(|| anyhow!("malformed data URI"))?;
    if !header.ends_with(";base64") {
        bail!("only base64 data URIs are supported");
    }
    Ok(base64::engine::general_purpose::STANDARD.decode(payload)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::AssetFormat;
    use crate::loaders::LoadToken;
    use crate::source::{AssetLocator, MemoryByteSource};

    /// Three positions then three u16 indices padded to 4 bytes.
    pub(crate) fn triangle_buffer(scale: f32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for p in [[0.0f32, 0.0, 0.0], [scale, 0.0, 0.0], [0.0, scale, 0.0]] {
            for c in p {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
        }
        for i in [0u16, 1, 2] {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes
    }

    pub(crate) fn triangle_json(uri: Option<&str>, byte_length: usize, scale: f32) -> String {
        let uri_field = uri.map(|u| format!("\"uri\": \"{u}\", ")).unwrap_or_default();
        format!(
            r#"{{
  "asset": {{ "version": "2.0" }},
  "scene": 0,
  "scenes": [{{ "nodes": [0] }}],
  "nodes": [{{ "name": "root", "translation": [1.0, 0.0, 0.0], "children": [1] }}, {{ "mesh": 0 }}],
  "meshes": [{{ "name": "tri", "primitives": [{{ "attributes": {{ "POSITION": 0 }}, "indices": 1, "material": 0 }}] }}],
  "materials": [{{ "name": "red", "pbrMetallicRoughness": {{ "baseColorFactor": [1.0, 0.0, 0.0, 1.0] }} }}],
  "buffers": [{{ {uri_field}"byteLength": {byte_length} }}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0.0, 0.0, 0.0], "max": [{scale}, {scale}, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ]
}}"#
        )
    }

    pub(crate) fn embedded_triangle_gltf() -> Vec<u8> {
        let buffer = triangle_buffer(1.0);
        let uri = format!(
            "data:application/octet-stream;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&buffer)
        );
        triangle_json(Some(&uri), buffer.len(), 1.0).into_bytes()
    }

    pub(crate) fn triangle_glb() -> Vec<u8> {
        let buffer = triangle_buffer(1.0);
        let mut json = triangle_json(None, buffer.len(), 1.0).into_bytes();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let total = 12 + 8 + json.len() + 8 + buffer.len();
        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&buffer);
        glb
    }

    fn parse(bytes: &[u8], locator: &str, format: AssetFormat, source: &MemoryByteSource) -> Result<LoadedAsset> {
        let locator = AssetLocator::parse(locator);
        let token = LoadToken::new(1);
        let ctx = ParseContext { locator: &locator, format, load_sequence: 0, source, token: &token };
        GltfLoader.parse(bytes, &ctx)
    }

    #[test]
    fn embedded_gltf_keeps_hierarchy_and_material() {
        let asset = parse(&embedded_triangle_gltf(), "tri.gltf", AssetFormat::Gltf, &MemoryByteSource::new())
            .expect("embedded gltf parses");
        assert_eq!(asset.tree.renderable_count(), 1);
        let bounds = asset.tree.aggregate_bounds();
        assert!((bounds.min - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6, "root translation applies");
        let items = asset.tree.draw_items();
        assert_eq!(items[0].geometry.index_count(), 3);
        assert_eq!(items[0].material.snapshot().base_color, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn glb_binary_chunk_is_used() {
        let asset =
            parse(&triangle_glb(), "tri.glb", AssetFormat::Glb, &MemoryByteSource::new()).expect("glb parses");
        assert_eq!(asset.tree.vertex_count(), 3);
        assert_eq!(asset.format, AssetFormat::Glb);
    }

    #[test]
    fn external_buffer_is_fetched_next_to_the_document() {
        let source = MemoryByteSource::new();
        let buffer = triangle_buffer(2.0);
        source.insert(AssetLocator::parse("https://cdn/m/tri.bin"), buffer.clone());
        let json = triangle_json(Some("tri.bin"), buffer.len(), 2.0);
        let asset = parse(json.as_bytes(), "https://cdn/m/tri.gltf", AssetFormat::Gltf, &source)
            .expect("external buffer resolves");
        assert_eq!(source.fetch_count(), 1);
        assert!((asset.tree.aggregate_bounds().size().y - 2.0).abs() < 1e-6);
    }

    #[test]
    fn primitive_with_bad_indices_is_skipped() {
        let mut buffer = triangle_buffer(1.0);
        for i in [0u16, 1, 9] {
            buffer.extend_from_slice(&i.to_le_bytes());
        }
        buffer.extend_from_slice(&[0, 0]);
        let json = format!(
            r#"{{
  "asset": {{ "version": "2.0" }},
  "scenes": [{{ "nodes": [0] }}],
  "nodes": [{{ "mesh": 0 }}],
  "meshes": [{{ "name": "pair", "primitives": [
    {{ "attributes": {{ "POSITION": 0 }}, "indices": 1 }},
    {{ "attributes": {{ "POSITION": 0 }}, "indices": 2 }}
  ] }}],
  "buffers": [{{ "uri": "data:application/octet-stream;base64,{}", "byteLength": {} }}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }},
    {{ "buffer": 0, "byteOffset": 44, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }},
    {{ "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ]
}}"#,
            base64::engine::general_purpose::STANDARD.encode(&buffer),
            buffer.len()
        );
        let asset = parse(json.as_bytes(), "pair.gltf", AssetFormat::Gltf, &MemoryByteSource::new())
            .expect("good primitive still loads");
        assert_eq!(asset.tree.renderable_count(), 1);
        assert!(asset.tree.nodes().any(|(_, node)| node.name.as_deref() == Some("pair::0")));
        assert_eq!(asset.skipped.len(), 1);
        assert!(asset.skipped[0].contains("index 9 out of range"), "{:?}", asset.skipped);
    }

    #[test]
    fn only_the_default_scene_is_loaded() {
        let buffer = triangle_buffer(1.0);
        let json = format!(
            r#"{{
  "asset": {{ "version": "2.0" }},
  "scene": 1,
  "scenes": [{{ "nodes": [0] }}, {{ "nodes": [1] }}],
  "nodes": [{{ "name": "first", "mesh": 0 }}, {{ "name": "second", "mesh": 0 }}],
  "meshes": [{{ "primitives": [{{ "attributes": {{ "POSITION": 0 }}, "indices": 1 }}] }}],
  "buffers": [{{ "uri": "data:application/octet-stream;base64,{}", "byteLength": {} }}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ]
}}"#,
            base64::engine::general_purpose::STANDARD.encode(&buffer),
            buffer.len()
        );
        let asset =
            parse(json.as_bytes(), "two.gltf", AssetFormat::Gltf, &MemoryByteSource::new()).expect("gltf parses");
        let names: Vec<_> = asset.tree.nodes().filter_map(|(_, node)| node.name.clone()).collect();
        assert!(names.iter().any(|name| name == "second"));
        assert!(!names.iter().any(|name| name == "first"));
    }

    #[test]
    fn garbage_reports_parser_error() {
        let err = parse(b"{ not json", "x.gltf", AssetFormat::Gltf, &MemoryByteSource::new()).unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
