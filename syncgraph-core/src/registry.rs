//! Object and document kinds.
//!
//! ```text
//! KindRegistry
//!   └── kinds: HashMap<tag, Box<dyn ObjectKind>>
//!         ├── make(sink, tag, parent)   defaults → create → append to parent
//!         └── update_for(op, graph)     SET_PROPERTY → PropertyUpdate
//! ```
//!
//! Each editor registers the kinds it can create. Dispatch goes through
//! the object's `type` property, so a replica that receives an object of
//! an unknown kind still stores it and simply gets `None` back from
//! [`KindRegistry::update_for`].

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

use crate::accessor::{GraphAccessor, CHILDREN};
use crate::command::GraphMutations;
use crate::error::GraphError;
use crate::graph::{DocGraph, OperationSink};
use crate::id::ObjectId;
use crate::operation::Operation;

/// What a view must refresh after a property changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyUpdate {
    /// Position, rotation or scale.
    Transform,
    /// Shape dimensions; the geometry has to be rebuilt.
    Geometry,
    /// Colour, visibility and other material state.
    Appearance,
    /// Text or styled content.
    Content,
    /// Tree links (`children`, `parent`).
    Structure,
    /// Titles and data with no visual effect.
    Metadata,
}

const TRANSFORM_KEYS: [&str; 9] = ["tx", "ty", "tz", "rx", "ry", "rz", "sx", "sy", "sz"];

/// Property routing shared by every kind.
pub fn base_update(name: &str) -> PropertyUpdate {
    match name {
        n if TRANSFORM_KEYS.contains(&n) => PropertyUpdate::Transform,
        "children" | "parent" => PropertyUpdate::Structure,
        "color" | "visible" => PropertyUpdate::Appearance,
        _ => PropertyUpdate::Metadata,
    }
}

fn transform(t: (f64, f64, f64)) -> Vec<(&'static str, Value)> {
    vec![
        ("tx", json!(t.0)),
        ("ty", json!(t.1)),
        ("tz", json!(t.2)),
        ("rx", json!(0)),
        ("ry", json!(0)),
        ("rz", json!(0)),
        ("sx", json!(1)),
        ("sy", json!(1)),
        ("sz", json!(1)),
    ]
}

/// A creatable object type.
pub trait ObjectKind: Send + Sync {
    /// Value of the `type` property.
    fn tag(&self) -> &str;

    /// Initial properties, excluding `type`, `children` and `parent`.
    fn defaults(&self) -> Vec<(&'static str, Value)>;

    /// Whether new objects get an empty `children` array.
    fn has_children(&self) -> bool {
        false
    }

    fn update_property(&self, name: &str) -> PropertyUpdate {
        base_update(name)
    }

    /// Create a detached object with this kind's defaults.
    fn make(&self, sink: &mut dyn OperationSink) -> Result<ObjectId, GraphError> {
        let mut props: Vec<(String, Value)> = vec![("type".into(), json!(self.tag()))];
        if self.has_children() {
            let arr = sink.create_array()?;
            props.push((CHILDREN.into(), arr.to_value()));
        }
        props.extend(self.defaults().into_iter().map(|(k, v)| (k.to_string(), v)));
        sink.create_object(props)
    }
}

// ─── Built-in object kinds ───────────────────────────────────────────

pub struct SceneKind;

impl ObjectKind for SceneKind {
    fn tag(&self) -> &str {
        "scene"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        vec![("title", json!("untitled scene")), ("visible", json!(true))]
    }
    fn has_children(&self) -> bool {
        true
    }
}

pub struct LayerKind;

impl ObjectKind for LayerKind {
    fn tag(&self) -> &str {
        "layer"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        vec![("title", json!("A Layer"))]
    }
    fn has_children(&self) -> bool {
        true
    }
}

pub struct CubeKind;

impl ObjectKind for CubeKind {
    fn tag(&self) -> &str {
        "cube"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        let mut props = vec![
            ("title", json!("first cube")),
            ("width", json!(1)),
            ("height", json!(1)),
            ("depth", json!(1)),
        ];
        props.extend(transform((0.0, 1.5, -5.0)));
        props.push(("color", json!("#00ff00")));
        props
    }
    fn update_property(&self, name: &str) -> PropertyUpdate {
        match name {
            "width" | "height" | "depth" => PropertyUpdate::Geometry,
            _ => base_update(name),
        }
    }
}

pub struct TextKind;

impl ObjectKind for TextKind {
    fn tag(&self) -> &str {
        "text"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        let mut props = vec![
            ("title", json!("some text")),
            ("visible", json!(true)),
            ("text", json!("cool <b>formatted</b> <i>text</i>")),
            (
                "cssStyle",
                json!("color:black;\nbackground-color:white;\nwidth: 10em;\nfont-size: 200%;\n"),
            ),
        ];
        props.extend(transform((0.0, 0.0, 0.0)));
        props
    }
    fn has_children(&self) -> bool {
        true
    }
    fn update_property(&self, name: &str) -> PropertyUpdate {
        match name {
            "text" | "cssStyle" => PropertyUpdate::Content,
            _ => base_update(name),
        }
    }
}

pub struct ModelKind;

impl ObjectKind for ModelKind {
    fn tag(&self) -> &str {
        "model"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        let mut props = vec![("title", json!("a model"))];
        props.extend(transform((0.0, 1.5, -5.0)));
        props.push(("color", json!("#ffffff")));
        props.push(("asset", json!(0)));
        props
    }
    fn update_property(&self, name: &str) -> PropertyUpdate {
        match name {
            "asset" => PropertyUpdate::Geometry,
            _ => base_update(name),
        }
    }
}

pub struct ParticlesKind;

impl ObjectKind for ParticlesKind {
    fn tag(&self) -> &str {
        "particles"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        let mut props = vec![("title", json!("particles")), ("visible", json!(true))];
        props.extend(transform((0.0, 1.5, -5.0)));
        props.push(("pointSize", json!(10.0)));
        props.push(("lifetime", json!(3.0)));
        props
    }
    fn has_children(&self) -> bool {
        true
    }
    fn update_property(&self, name: &str) -> PropertyUpdate {
        match name {
            "pointSize" | "lifetime" | "texture" => PropertyUpdate::Appearance,
            _ => base_update(name),
        }
    }
}

pub struct ImageAnchorKind;

impl ObjectKind for ImageAnchorKind {
    fn tag(&self) -> &str {
        "image_anchor"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        let mut props = vec![("title", json!("image anchor")), ("visible", json!(true))];
        props.extend(transform((0.0, 0.0, -5.0)));
        props.push(("color", json!("#00ff00")));
        props.push(("imageRealworldWidth", json!(1)));
        props.push(("recType", json!("SCENE_START")));
        props
    }
    fn has_children(&self) -> bool {
        true
    }
}

pub struct PersonKind;

impl ObjectKind for PersonKind {
    fn tag(&self) -> &str {
        "person"
    }
    fn defaults(&self) -> Vec<(&'static str, Value)> {
        vec![("name", json!("unnamed"))]
    }
    fn update_property(&self, name: &str) -> PropertyUpdate {
        match name {
            "name" => PropertyUpdate::Content,
            _ => base_update(name),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────

/// Tag → kind lookup.
#[derive(Default)]
pub struct KindRegistry {
    kinds: HashMap<String, Box<dyn ObjectKind>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SceneKind);
        registry.register(LayerKind);
        registry.register(CubeKind);
        registry.register(TextKind);
        registry.register(ModelKind);
        registry.register(ParticlesKind);
        registry.register(ImageAnchorKind);
        registry.register(PersonKind);
        registry
    }

    /// Add a kind, replacing any previous kind with the same tag.
    pub fn register(&mut self, kind: impl ObjectKind + 'static) {
        let tag = kind.tag().to_string();
        if self.kinds.insert(tag.clone(), Box::new(kind)).is_some() {
            log::debug!("replaced object kind '{tag}'");
        }
    }

    pub fn get(&self, tag: &str) -> Option<&dyn ObjectKind> {
        self.kinds.get(tag).map(Box::as_ref)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Create an object of kind `tag` and append it to `parent`'s children.
    ///
    /// Returns `Ok(None)` for an unregistered tag.
    pub fn make(
        &self,
        sink: &mut dyn OperationSink,
        tag: &str,
        parent: &ObjectId,
    ) -> Result<Option<ObjectId>, GraphError> {
        let Some(kind) = self.get(tag) else {
            log::warn!("no object kind registered for '{tag}'");
            return Ok(None);
        };
        make_child(sink, kind, parent).map(Some)
    }

    /// Refresh needed for a property operation, dispatched on the target's
    /// `type`. `None` for structural ops and untyped or unknown objects.
    pub fn update_for(&self, op: &Operation, graph: &DocGraph) -> Option<PropertyUpdate> {
        let name = op.property_name()?;
        let tag = graph.property(op.target(), "type")?.as_str()?;
        self.get(tag).map(|kind| kind.update_property(name))
    }
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindRegistry")
            .field("kinds", &self.tags())
            .finish()
    }
}

/// Create an object of `kind` and append it to `parent`'s children.
pub fn make_child(
    sink: &mut dyn OperationSink,
    kind: &dyn ObjectKind,
    parent: &ObjectId,
) -> Result<ObjectId, GraphError> {
    if !sink.graph().has_object(parent) {
        return Err(GraphError::MissingObject(parent.clone()));
    }
    let id = kind.make(sink)?;
    let mut accessor = GraphAccessor::new(sink);
    if let Some(mut handle) = accessor.object(parent).found() {
        handle.insert_child_last(&id)?;
    }
    Ok(id)
}

// ─── Document kinds ──────────────────────────────────────────────────

/// A document type: which root marker it uses and what a new document
/// starts with.
pub trait DocumentKind: Send + Sync {
    /// Value of the persisted document's `type` field.
    fn doc_type(&self) -> &str;

    /// `type` property that marks the root object.
    fn root_type(&self) -> &str;

    fn root_title(&self) -> &str;

    /// Create a root with an empty `children` array.
    fn make_empty_root(&self, sink: &mut dyn OperationSink) -> Result<ObjectId, GraphError> {
        let arr = sink.create_array()?;
        sink.create_object([
            ("type", json!(self.root_type())),
            ("title", json!(self.root_title())),
            (CHILDREN, arr.to_value()),
        ])
    }

    /// Starter content for a brand-new document.
    fn populate(&self, _sink: &mut dyn OperationSink, _root: &ObjectId) -> Result<(), GraphError> {
        Ok(())
    }

    /// Locate this kind's root in `graph`.
    fn find_root(&self, graph: &DocGraph) -> Option<ObjectId> {
        graph
            .object_by_property("type", &json!(self.root_type()))
            .cloned()
    }
}

/// Immersive VR scene editor.
pub struct VrDocument;

impl DocumentKind for VrDocument {
    fn doc_type(&self) -> &str {
        "vr"
    }
    fn root_type(&self) -> &str {
        "root"
    }
    fn root_title(&self) -> &str {
        "root"
    }
    fn populate(&self, sink: &mut dyn OperationSink, root: &ObjectId) -> Result<(), GraphError> {
        make_child(sink, &SceneKind, root)?;
        Ok(())
    }
}

/// 360 editor: a stack of scenes, each holding layers.
pub struct Editor360Document;

impl DocumentKind for Editor360Document {
    fn doc_type(&self) -> &str {
        "360"
    }
    fn root_type(&self) -> &str {
        "stack"
    }
    fn root_title(&self) -> &str {
        "stack"
    }
    fn populate(&self, sink: &mut dyn OperationSink, root: &ObjectId) -> Result<(), GraphError> {
        let scene = make_child(sink, &SceneKind, root)?;
        make_child(sink, &LayerKind, &scene)?;
        Ok(())
    }
}

pub struct FamilyTreeDocument;

impl DocumentKind for FamilyTreeDocument {
    fn doc_type(&self) -> &str {
        "familytree"
    }
    fn root_type(&self) -> &str {
        "root"
    }
    fn root_title(&self) -> &str {
        "my family tree"
    }
    fn populate(&self, sink: &mut dyn OperationSink, root: &ObjectId) -> Result<(), GraphError> {
        let person = make_child(sink, &PersonKind, root)?;
        sink.set_property(&person, "name", "bob")
    }
}

/// Look up a built-in document kind by its `type` string.
pub fn builtin_document(doc_type: &str) -> Option<Box<dyn DocumentKind>> {
    match doc_type {
        "vr" => Some(Box::new(VrDocument)),
        "360" => Some(Box::new(Editor360Document)),
        "familytree" => Some(Box::new(FamilyTreeDocument)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vr_root(g: &mut DocGraph) -> ObjectId {
        VrDocument.make_empty_root(g).unwrap()
    }

    #[test]
    fn test_builtin_registry() {
        let registry = KindRegistry::with_builtin();
        assert_eq!(registry.len(), 8);
        assert!(registry.get("cube").is_some());
        assert!(registry.get("teapot").is_none());
        assert_eq!(registry.tags()[0], "cube");
    }

    #[test]
    fn test_make_appends_to_parent() {
        let registry = KindRegistry::with_builtin();
        let mut g = DocGraph::new();
        let root = vr_root(&mut g);

        let cube = registry.make(&mut g, "cube", &root).unwrap().unwrap();
        assert_eq!(cube.prefix(), Some("cube"));
        assert_eq!(g.property(&cube, "ty"), Some(&json!(1.5)));
        assert_eq!(g.property(&cube, "color"), Some(&json!("#00ff00")));
        assert_eq!(g.property(&cube, "parent"), Some(&root.to_value()));
        assert!(!g.has_property_value(&cube, CHILDREN));

        let acc = GraphAccessor::new(&mut g);
        assert_eq!(acc.children_of(&root), vec![cube]);
    }

    #[test]
    fn test_make_unknown_tag_or_parent() {
        let registry = KindRegistry::with_builtin();
        let mut g = DocGraph::new();
        let root = vr_root(&mut g);
        assert_eq!(registry.make(&mut g, "teapot", &root).unwrap(), None);
        assert!(matches!(
            registry.make(&mut g, "cube", &ObjectId::new("ghost")),
            Err(GraphError::MissingObject(_))
        ));
    }

    #[test]
    fn test_container_kinds_get_children() {
        let registry = KindRegistry::with_builtin();
        let mut g = DocGraph::new();
        let root = vr_root(&mut g);
        let text = registry.make(&mut g, "text", &root).unwrap().unwrap();
        let arr = g
            .property(&text, CHILDREN)
            .and_then(ObjectId::from_value)
            .unwrap();
        assert_eq!(g.array_len(&arr), Some(0));
    }

    #[test]
    fn test_update_dispatch() {
        let registry = KindRegistry::with_builtin();
        let mut g = DocGraph::new();
        let root = vr_root(&mut g);
        let cube = registry.make(&mut g, "cube", &root).unwrap().unwrap();

        g.set_property(&cube, "width", 3).unwrap();
        let op = g.history().last().unwrap().clone();
        assert_eq!(registry.update_for(&op, &g), Some(PropertyUpdate::Geometry));

        g.set_property(&cube, "rx", 0.5).unwrap();
        let op = g.history().last().unwrap().clone();
        assert_eq!(registry.update_for(&op, &g), Some(PropertyUpdate::Transform));

        // Root type "root" is not a registered object kind.
        g.set_property(&root, "title", "x").unwrap();
        let op = g.history().last().unwrap().clone();
        assert_eq!(registry.update_for(&op, &g), None);
    }

    #[test]
    fn test_empty_roots_have_no_children() {
        for kind in ["vr", "360", "familytree"] {
            let doc = builtin_document(kind).unwrap();
            let mut g = DocGraph::new();
            let root = doc.make_empty_root(&mut g).unwrap();
            assert_eq!(doc.find_root(&g), Some(root.clone()));
            assert!(GraphAccessor::new(&mut g).children_of(&root).is_empty());
        }
        assert!(builtin_document("spreadsheet").is_none());
    }

    #[test]
    fn test_360_starter_content() {
        let mut g = DocGraph::new();
        let root = Editor360Document.make_empty_root(&mut g).unwrap();
        Editor360Document.populate(&mut g, &root).unwrap();

        assert_eq!(g.property(&root, "type"), Some(&json!("stack")));
        let acc = GraphAccessor::new(&mut g);
        let scenes = acc.children_of(&root);
        assert_eq!(scenes.len(), 1);
        let layers = acc.children_of(&scenes[0]);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].prefix(), Some("layer"));
    }

    #[test]
    fn test_family_tree_starter_person() {
        let mut g = DocGraph::new();
        let root = FamilyTreeDocument.make_empty_root(&mut g).unwrap();
        FamilyTreeDocument.populate(&mut g, &root).unwrap();
        let people = GraphAccessor::new(&mut g).children_of(&root);
        assert_eq!(g.property(&people[0], "name"), Some(&json!("bob")));
    }
}
