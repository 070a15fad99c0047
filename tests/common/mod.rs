#![allow(dead_code)]

use asset_viewer::config::AppConfig;
use asset_viewer::load_worker::LoadWorker;
use asset_viewer::render_loop::RecordingBackend;
use asset_viewer::session::{LoadStatus, ViewerSession};
use asset_viewer::source::{AssetLocator, MemoryByteSource};
use base64::Engine as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn inline_session(source: Arc<MemoryByteSource>) -> ViewerSession<RecordingBackend> {
    ViewerSession::new(&AppConfig::default(), RecordingBackend::new(), LoadWorker::inline(source))
}

pub fn source_with(entries: &[(&str, Vec<u8>)]) -> Arc<MemoryByteSource> {
    let source = MemoryByteSource::new();
    for (locator, bytes) in entries {
        source.insert(AssetLocator::parse(locator), bytes.clone());
    }
    Arc::new(source)
}

/// Polls until the session leaves `Loading` or the deadline passes.
pub fn poll_until_settled(session: &mut ViewerSession<RecordingBackend>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        session.poll();
        if !matches!(session.status(), LoadStatus::Loading(_)) {
            return;
        }
        assert!(Instant::now() < deadline, "load never settled");
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn binary_stl(triangles: &[[[f32; 3]; 3]]) -> Vec<u8> {
    let mut bytes = vec![0u8; 80];
    bytes.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
    for tri in triangles {
        bytes.extend_from_slice(&[0u8; 12]);
        for corner in tri {
            for c in corner {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
        }
        bytes.extend_from_slice(&[0, 0]);
    }
    bytes
}

pub fn ascii_stl() -> Vec<u8> {
    b"solid part
  facet normal 0 0 1
    outer loop
      vertex 0 0 0
      vertex 1 0 0
      vertex 0 1 0
    endloop
  endfacet
endsolid part
"
    .to_vec()
}

pub fn obj_two_groups() -> Vec<u8> {
    b"# two squares far apart
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
v 10 0 0
v 11 0 0
v 11 1 0
v 10 1 0
o left
f 1 2 3 4
o right
usemtl missing
f 5 6 7 8
"
    .to_vec()
}

pub fn ascii_ply() -> Vec<u8> {
    b"ply
format ascii 1.0
element vertex 3
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
0 1 0
3 0 1 2
"
    .to_vec()
}

fn triangle_buffer() -> Vec<u8> {
    let mut bytes = Vec::new();
    for p in [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] {
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

fn triangle_gltf_json(uri: Option<String>, byte_length: usize) -> String {
    let buffer = match uri {
        Some(uri) => format!(r#"{{ "uri": "{uri}", "byteLength": {byte_length} }}"#),
        None => format!(r#"{{ "byteLength": {byte_length} }}"#),
    };
    format!(
        r#"{{
  "asset": {{ "version": "2.0" }},
  "scene": 0,
  "scenes": [{{ "nodes": [0] }}],
  "nodes": [{{ "mesh": 0 }}],
  "meshes": [{{ "primitives": [{{ "attributes": {{ "POSITION": 0 }}, "indices": 1 }}] }}],
  "buffers": [{buffer}],
  "bufferViews": [
    {{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }},
    {{ "buffer": 0, "byteOffset": 36, "byteLength": 6 }}
  ],
  "accessors": [
    {{ "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0] }},
    {{ "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }}
  ]
}}"#
    )
}

pub fn embedded_gltf() -> Vec<u8> {
    let buffer = triangle_buffer();
    let uri = format!(
        "data:application/octet-stream;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&buffer)
    );
    triangle_gltf_json(Some(uri), buffer.len()).into_bytes()
}

pub fn glb() -> Vec<u8> {
    let buffer = triangle_buffer();
    let mut json = triangle_gltf_json(None, buffer.len()).into_bytes();
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
    let total = 12 + 8 + json.len() + 8 + buffer.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&json);
    out.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
    out.extend_from_slice(b"BIN\0");
    out.extend_from_slice(&buffer);
    out
}

enum FbxProp {
    Long(i64),
    Text(&'static str),
    Doubles(Vec<f64>),
    Ints(Vec<i32>),
}

struct FbxNode {
    name: &'static str,
    props: Vec<FbxProp>,
    children: Vec<FbxNode>,
}

fn fbx_node(name: &'static str, props: Vec<FbxProp>, children: Vec<FbxNode>) -> FbxNode {
    FbxNode { name, props, children }
}

fn write_fbx_node(out: &mut Vec<u8>, node: &FbxNode) {
    let start = out.len();
    out.extend_from_slice(&[0u8; 12]);
    out.push(node.name.len() as u8);
    out.extend_from_slice(node.name.as_bytes());
    let props_start = out.len();
    for prop in &node.props {
        match prop {
            FbxProp::Long(v) => {
                out.push(b'L');
                out.extend_from_slice(&v.to_le_bytes());
            }
            FbxProp::Text(s) => {
                out.push(b'S');
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            FbxProp::Doubles(values) => {
                out.push(b'd');
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&((values.len() * 8) as u32).to_le_bytes());
                values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
            }
            FbxProp::Ints(values) => {
                out.push(b'i');
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&((values.len() * 4) as u32).to_le_bytes());
                values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
            }
        }
    }
    let props_len = out.len() - props_start;
    for child in &node.children {
        write_fbx_node(out, child);
    }
    if !node.children.is_empty() {
        out.extend_from_slice(&[0u8; 13]);
    }
    let end = out.len() as u32;
    out[start..start + 4].copy_from_slice(&end.to_le_bytes());
    out[start + 4..start + 8].copy_from_slice(&(node.props.len() as u32).to_le_bytes());
    out[start + 8..start + 12].copy_from_slice(&(props_len as u32).to_le_bytes());
}

/// Binary FBX 7400 with a single triangle geometry attached to the root.
pub fn binary_fbx() -> Vec<u8> {
    let geometry = fbx_node(
        "Geometry",
        vec![FbxProp::Long(1), FbxProp::Text("Tri\u{0}\u{1}Geometry"), FbxProp::Text("Mesh")],
        vec![
            fbx_node("Vertices", vec![FbxProp::Doubles(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0])], vec![]),
            fbx_node("PolygonVertexIndex", vec![FbxProp::Ints(vec![0, 1, !2])], vec![]),
        ],
    );
    let mut out = b"Kaydara FBX Binary  \0".to_vec();
    out.extend_from_slice(&[0x1a, 0x00]);
    out.extend_from_slice(&7400u32.to_le_bytes());
    write_fbx_node(&mut out, &fbx_node("Objects", vec![], vec![geometry]));
    write_fbx_node(
        &mut out,
        &fbx_node(
            "Connections",
            vec![],
            vec![fbx_node("C", vec![FbxProp::Text("OO"), FbxProp::Long(1), FbxProp::Long(0)], vec![])],
        ),
    );
    out.extend_from_slice(&[0u8; 13]);
    out.extend_from_slice(&[0u8; 16]);
    out
}
