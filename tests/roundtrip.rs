use std::rc::Rc;

use proptest::prelude::*;

use tagpack::packed::{PackedBlob, PackedEntry, PackedReader, PackedWriter, PtrSize};
use tagpack::schema::{Class, Member, Primitive, SchemaSet, WireType};
use tagpack::tagged::{TaggedBlob, TaggedItem, TaggedReader, TaggedWriter};
use tagpack::value::{Object, Value};
use tagpack::BlobError;

// Offsets leave room for the widest (64-bit packed) encoding of each
// member, so one schema serves both formats and both pointer sizes.
fn skeleton_schemas() -> (SchemaSet, usize, usize) {
    let mut set = SchemaSet::new();
    let bone = set.reserve("Bone");
    let mut bone_class = Class::new("Bone", 24);
    bone_class.alignment = 8;
    bone_class.members.push(Member::new("name", 0, WireType::Str));
    bone_class.members.push(Member::new(
        "parent",
        8,
        WireType::back_ref(WireType::Class(bone)),
    ));
    bone_class.members.push(Member::new(
        "length",
        16,
        WireType::Primitive(Primitive::Float32),
    ));
    set.define(bone_class).unwrap();

    let mut skeleton = Class::new("Skeleton", 24);
    skeleton.alignment = 8;
    skeleton.members.push(Member::new("name", 0, WireType::Str));
    // Bones are pointed to (by back-references), so the container holds
    // owning pointers rather than inline instances.
    skeleton.members.push(Member::new(
        "bones",
        8,
        WireType::array(WireType::raw_pointer(WireType::Class(bone))),
    ));
    let skel = set.define(skeleton).unwrap();
    (set, bone, skel)
}

fn bone(set: &SchemaSet, name: &str, length: f32) -> Value {
    let id = set.lookup("Bone").unwrap();
    let obj = Object::new(id);
    obj.borrow_mut().set("name", Value::string(name));
    obj.borrow_mut().set("parent", Value::Null);
    obj.borrow_mut().set("length", Value::F32(length));
    Value::Object(obj)
}

fn skeleton_graph(set: &SchemaSet) -> Value {
    let root = bone(set, "root", 1.0);
    let child = bone(set, "spine", 0.5);
    child
        .as_object()
        .unwrap()
        .borrow_mut()
        .set("parent", root.clone());

    let skel = Object::new(set.lookup("Skeleton").unwrap());
    skel.borrow_mut().set("name", Value::string("biped"));
    skel.borrow_mut()
        .set("bones", Value::array(vec![root, child]));
    Value::Object(skel)
}

fn field(value: &Value, name: &str) -> Value {
    value
        .as_object()
        .unwrap()
        .borrow()
        .get(name)
        .cloned()
        .unwrap()
}

#[test]
fn tagged_roundtrip_preserves_the_graph() {
    let (set, _, _) = skeleton_schemas();
    let graph = skeleton_graph(&set);

    let blob = TaggedWriter::new(&set).pack_root(&graph).unwrap();
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();

    assert_eq!(field(&decoded, "name"), Value::string("biped"));
    let bones = field(&decoded, "bones");
    let bones = bones.as_array().unwrap().borrow();
    assert_eq!(bones.len(), 2);
    assert_eq!(field(&bones[1], "length"), Value::F32(0.5));

    // spine.parent resolves to the same shared instance as bones[0].
    let parent = field(&bones[1], "parent");
    assert!(Rc::ptr_eq(
        parent.as_object().unwrap(),
        bones[0].as_object().unwrap()
    ));
}

#[test]
fn packed_roundtrip_at_both_pointer_widths() {
    let (set, _, _) = skeleton_schemas();
    for ptr in [PtrSize::Four, PtrSize::Eight] {
        let graph = skeleton_graph(&set);
        let blob = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
        let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();

        assert_eq!(field(&decoded, "name"), Value::string("biped"));
        let bones = field(&decoded, "bones");
        let bones = bones.as_array().unwrap().borrow();
        assert_eq!(bones.len(), 2);
        assert_eq!(field(&bones[0], "name"), Value::string("root"));
        let parent = field(&bones[1], "parent");
        assert!(Rc::ptr_eq(
            parent.as_object().unwrap(),
            bones[0].as_object().unwrap()
        ));
    }
}

#[test]
fn shared_values_pack_to_one_item() {
    let mut set = SchemaSet::new();
    let mut holder = Class::new("Holder", 8);
    holder.members.push(Member::new(
        "a",
        0,
        WireType::array(WireType::Primitive(Primitive::Float32)),
    ));
    holder.members.push(Member::new(
        "b",
        4,
        WireType::array(WireType::Primitive(Primitive::Float32)),
    ));
    let id = set.define(holder).unwrap();

    let shared = Value::array(vec![Value::F32(1.0), Value::F32(2.0)]);
    let obj = Object::new(id);
    obj.borrow_mut().set("a", shared.clone());
    obj.borrow_mut().set("b", shared);

    let blob = TaggedWriter::new(&set)
        .pack_root(&Value::Object(obj))
        .unwrap();
    let array_items = blob
        .items
        .iter()
        .filter(|i| matches!(i.ty, WireType::Array(_)))
        .count();
    assert_eq!(array_items, 1);
    // Both member slots carry the same item index.
    let root = &blob.items[1].data;
    assert_eq!(root[0..4], root[4..8]);

    // And the decoded members are one shared handle again.
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    let a = field(&decoded, "a");
    let b = field(&decoded, "b");
    assert!(Rc::ptr_eq(a.as_array().unwrap(), b.as_array().unwrap()));
}

#[test]
fn back_reference_cycles_decode_without_recursing() {
    let mut set = SchemaSet::new();
    let node = set.reserve("Node");
    let mut node_class = Class::new("Node", 16);
    node_class.members.push(Member::new(
        "next",
        0,
        WireType::raw_pointer(WireType::Class(node)),
    ));
    node_class.members.push(Member::new(
        "prev",
        8,
        WireType::back_ref(WireType::Class(node)),
    ));
    set.define(node_class).unwrap();

    let head = Object::new(node);
    let tail = Object::new(node);
    head.borrow_mut().set("next", Value::Object(tail.clone()));
    head.borrow_mut().set("prev", Value::Null);
    tail.borrow_mut().set("next", Value::Null);
    tail.borrow_mut().set("prev", Value::Object(head.clone()));

    let blob = TaggedWriter::new(&set)
        .pack_root(&Value::Object(head))
        .unwrap();
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    let next = field(&decoded, "next");
    let prev_of_next = field(&next, "prev");
    assert!(Rc::ptr_eq(
        prev_of_next.as_object().unwrap(),
        decoded.as_object().unwrap()
    ));
}

#[test]
fn null_pointers_and_gaps_stay_zero() {
    let (set, bone_id, _) = skeleton_schemas();
    let graph = bone(&set, "lone", 2.0);

    let blob = TaggedWriter::new(&set).pack_root(&graph).unwrap();
    let item = &blob.items[1];
    assert!(matches!(item.ty, WireType::Class(id) if id == bone_id));
    // parent is null: its index slot and the tail padding stay zero.
    assert_eq!(&item.data[8..12], &[0, 0, 0, 0]);
    assert_eq!(&item.data[20..24], &[0, 0, 0, 0]);

    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    assert!(field(&decoded, "parent").is_null());
}

#[test]
fn fixed_struct_length_is_enforced() {
    let mut set = SchemaSet::new();
    let mut xform = Class::new("Transform", 48);
    xform.members.push(Member::new(
        "matrix",
        0,
        WireType::fixed_struct(WireType::Primitive(Primitive::Float32), 12).unwrap(),
    ));
    let id = set.define(xform).unwrap();

    let obj = Object::new(id);
    obj.borrow_mut()
        .set("matrix", Value::Tuple(vec![Value::F32(1.0); 3]));
    let err = TaggedWriter::new(&set).pack_root(&Value::Object(obj));
    assert!(matches!(
        err,
        Err(BlobError::StructLengthMismatch {
            expected: 12,
            actual: 3,
            ..
        })
    ));
}

fn variant_schemas() -> (SchemaSet, usize, usize) {
    let mut set = SchemaSet::new();
    let mut slot = Class::new("VariantSlot", 24);
    slot.alignment = 8;
    slot.members.push(Member::new("name", 0, WireType::Str));
    slot.members.push(Member::new("className", 8, WireType::Str));
    slot.members
        .push(Member::new("variant", 16, WireType::VariantPointer));
    let slot_id = set.define(slot).unwrap();

    let mut payload = Class::new("Payload", 4);
    payload.members.push(Member::new(
        "x",
        0,
        WireType::Primitive(Primitive::Int32),
    ));
    let payload_id = set.define(payload).unwrap();
    (set, slot_id, payload_id)
}

#[test]
fn named_variant_resolves_by_class_name() {
    let (set, slot_id, payload_id) = variant_schemas();
    let payload = Object::new(payload_id);
    payload.borrow_mut().set("x", Value::Int(42));
    let slot = Object::new(slot_id);
    slot.borrow_mut().set("name", Value::string("slot0"));
    slot.borrow_mut().set("className", Value::string("Payload"));
    slot.borrow_mut().set("variant", Value::Object(payload));

    for ptr in [PtrSize::Four, PtrSize::Eight] {
        let graph = Value::Object(slot.clone());
        let blob = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
        let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();
        let variant = field(&decoded, "variant");
        assert_eq!(variant.as_object().unwrap().borrow().class, payload_id);
        assert_eq!(field(&variant, "x"), Value::Int(42));
    }

    let blob = TaggedWriter::new(&set)
        .pack_root(&Value::Object(slot))
        .unwrap();
    // Name string item precedes the class-name string item.
    let strings: Vec<&str> = blob
        .items
        .iter()
        .filter(|i| matches!(i.ty, WireType::Str))
        .map(|i| std::str::from_utf8(&i.data[..i.data.len() - 1]).unwrap())
        .collect();
    assert_eq!(strings, vec!["slot0", "Payload"]);
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    assert_eq!(field(&field(&decoded, "variant"), "x"), Value::Int(42));
}

#[test]
fn unknown_variant_class_name_is_fatal() {
    let (set, slot_id, _) = variant_schemas();
    let mut blob = TaggedBlob::new();
    let mut data = vec![0u8; 24];
    data[8] = 2; // className → item 2
    blob.items.push(TaggedItem {
        ty: WireType::Class(slot_id),
        data,
        count: 1,
    });
    blob.items.push(TaggedItem {
        ty: WireType::Str,
        data: b"Ghost\0".to_vec(),
        count: 6,
    });

    assert!(matches!(
        TaggedReader::new(&set, blob).unpack_root(),
        Err(BlobError::UnknownVariantClass(name)) if name == "Ghost"
    ));
}

#[test]
fn packed_pointer_without_a_fixup_row_is_fatal() {
    let mut set = SchemaSet::new();
    let node = set.reserve("Node");
    let mut node_class = Class::new("Node", 8);
    node_class.alignment = 8;
    node_class.members.push(Member::new(
        "next",
        0,
        WireType::raw_pointer(WireType::Class(node)),
    ));
    set.define(node_class).unwrap();

    let blob = PackedBlob {
        ptr_size: PtrSize::Eight,
        data: vec![0xff; 8],
        entries: vec![PackedEntry {
            ty: WireType::Class(node),
            start: 0,
            len: 8,
            count: 1,
        }],
        fixups: Default::default(),
    };
    assert!(matches!(
        PackedReader::new(&set, blob).unpack_root(),
        Err(BlobError::UnresolvedPointer { position: 0 })
    ));
}

#[test]
fn base_object_descendants_carry_a_zero_vtable_slot() {
    let mut set = SchemaSet::new();
    let base = set.set_base_object("BaseObject");
    set.define(Class::new("BaseObject", 0)).unwrap();
    let mut counter = Class::new("Counter", 4);
    counter.parent = Some(base);
    counter.members.push(Member::new(
        "count",
        0,
        WireType::Primitive(Primitive::UInt32),
    ));
    let id = set.define(counter).unwrap();

    let obj = Object::new(id);
    obj.borrow_mut().set("count", Value::UInt(9));
    let blob = PackedWriter::new(&set, PtrSize::Eight)
        .pack_root(&Value::Object(obj))
        .unwrap();

    // One pointer of padding ahead of the first member.
    assert_eq!(blob.entries[0].len, 12);
    assert_eq!(&blob.data[0..8], &[0u8; 8]);
    assert_eq!(&blob.data[8..12], &9u32.to_le_bytes());

    let mut corrupted = blob.clone();
    corrupted.data[0] = 1;
    assert!(matches!(
        PackedReader::new(&set, corrupted).unpack_root(),
        Err(BlobError::NonZeroReserved { position: 0 })
    ));

    let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();
    assert_eq!(field(&decoded, "count"), Value::UInt(9));
}

#[test]
fn repacking_a_decoded_graph_reproduces_the_bytes() {
    let (set, _, _) = skeleton_schemas();
    let graph = skeleton_graph(&set);

    let original = TaggedWriter::new(&set).pack_root(&graph).unwrap();
    let decoded = TaggedReader::new(&set, original.clone())
        .unpack_root()
        .unwrap();
    let repacked = TaggedWriter::new(&set).pack_root(&decoded).unwrap();
    assert_eq!(original.items.len(), repacked.items.len());
    for (a, b) in original.items.iter().zip(&repacked.items) {
        assert_eq!(a.ty, b.ty);
        assert_eq!(a.data, b.data);
        assert_eq!(a.count, b.count);
    }

    for ptr in [PtrSize::Four, PtrSize::Eight] {
        let original = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
        let decoded = PackedReader::new(&set, original.clone())
            .unpack_root()
            .unwrap();
        let repacked = PackedWriter::new(&set, ptr).pack_root(&decoded).unwrap();
        assert_eq!(original.data, repacked.data);
        assert_eq!(original.fixups, repacked.fixups);
        assert_eq!(original.entries.len(), repacked.entries.len());
        for (a, b) in original.entries.iter().zip(&repacked.entries) {
            assert_eq!(a.ty, b.ty);
            assert_eq!(a.start, b.start);
            assert_eq!(a.len, b.len);
            assert_eq!(a.count, b.count);
        }
    }
}

#[test]
fn inline_class_arrays_roundtrip() {
    let mut set = SchemaSet::new();
    let mut vec3 = Class::new("Vec3", 12);
    vec3.members
        .push(Member::new("x", 0, WireType::Primitive(Primitive::Float32)));
    vec3.members
        .push(Member::new("y", 4, WireType::Primitive(Primitive::Float32)));
    vec3.members
        .push(Member::new("z", 8, WireType::Primitive(Primitive::Float32)));
    let vec3 = set.define(vec3).unwrap();

    let mut cloud = Class::new("PointCloud", 16);
    cloud.alignment = 8;
    cloud.members.push(Member::new(
        "points",
        0,
        WireType::array(WireType::Class(vec3)),
    ));
    let cloud = set.define(cloud).unwrap();

    let point = |x: f32, y: f32, z: f32| {
        let p = Object::new(vec3);
        p.borrow_mut().set("x", Value::F32(x));
        p.borrow_mut().set("y", Value::F32(y));
        p.borrow_mut().set("z", Value::F32(z));
        Value::Object(p)
    };
    let obj = Object::new(cloud);
    obj.borrow_mut().set(
        "points",
        Value::array(vec![point(1.0, 2.0, 3.0), point(4.0, 5.0, 6.0)]),
    );
    let graph = Value::Object(obj);

    let blob = TaggedWriter::new(&set).pack_root(&graph).unwrap();
    // Elements are inline: one array item, no per-element items.
    assert_eq!(blob.items.len(), 3);
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    assert_eq!(decoded, graph);

    for ptr in [PtrSize::Four, PtrSize::Eight] {
        let blob = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
        let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();
        assert_eq!(decoded, graph);
    }
}

#[test]
fn relative_arrays_share_the_array_encoding() {
    let mut set = SchemaSet::new();
    let mut holder = Class::new("Holder", 32);
    holder.alignment = 8;
    holder.members.push(Member::new(
        "plain",
        0,
        WireType::array(WireType::Primitive(Primitive::Float32)),
    ));
    holder.members.push(Member::new(
        "relative",
        16,
        WireType::rel_array(WireType::Primitive(Primitive::Float32)),
    ));
    let id = set.define(holder).unwrap();

    let obj = Object::new(id);
    obj.borrow_mut()
        .set("plain", Value::array(vec![Value::F32(1.0), Value::F32(2.0)]));
    obj.borrow_mut().set(
        "relative",
        Value::array(vec![Value::F32(1.0), Value::F32(2.0)]),
    );
    let graph = Value::Object(obj);

    let blob = TaggedWriter::new(&set).pack_root(&graph).unwrap();
    // Same element bytes regardless of array category.
    assert!(matches!(blob.items[2].ty, WireType::Array(_)));
    assert!(matches!(blob.items[3].ty, WireType::RelArray(_)));
    assert_eq!(blob.items[2].data, blob.items[3].data);
    let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
    assert_eq!(field(&decoded, "plain"), field(&decoded, "relative"));

    for ptr in [PtrSize::Four, PtrSize::Eight] {
        let blob = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
        let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();
        assert_eq!(field(&decoded, "plain"), field(&decoded, "relative"));
    }
}

#[test]
fn shared_targets_are_type_checked_for_every_pointer() {
    let mut set = SchemaSet::new();
    let anchor = set.define(Class::new("Anchor", 4)).unwrap();
    let mut widget = Class::new("Widget", 4);
    widget.members.push(Member::new(
        "v",
        0,
        WireType::Primitive(Primitive::UInt32),
    ));
    let widget = set.define(widget).unwrap();

    let mut holder = Class::new("Holder", 16);
    holder.alignment = 8;
    holder.members.push(Member::new(
        "first",
        0,
        WireType::raw_pointer(WireType::Class(widget)),
    ));
    holder.members.push(Member::new(
        "second",
        8,
        WireType::raw_pointer(WireType::Class(anchor)),
    ));
    let holder = set.define(holder).unwrap();

    // One shared target: valid for `first`, wrong class for `second`. The
    // mismatch must surface even though the target was already packed.
    let shared = Object::new(widget);
    shared.borrow_mut().set("v", Value::UInt(1));
    let obj = Object::new(holder);
    obj.borrow_mut().set("first", Value::Object(shared.clone()));
    obj.borrow_mut().set("second", Value::Object(shared));
    let graph = Value::Object(obj);

    assert!(matches!(
        TaggedWriter::new(&set).pack_root(&graph),
        Err(BlobError::PointerTypeMismatch { .. })
    ));
    assert!(matches!(
        PackedWriter::new(&set, PtrSize::Eight).pack_root(&graph),
        Err(BlobError::PointerTypeMismatch { .. })
    ));
}

fn scalar_schemas() -> (SchemaSet, usize) {
    let mut set = SchemaSet::new();
    let mut sample = Class::new("Sample", 40);
    sample.alignment = 8;
    sample.members.push(Member::new(
        "i",
        0,
        WireType::Primitive(Primitive::Int32),
    ));
    sample.members.push(Member::new(
        "u",
        8,
        WireType::Primitive(Primitive::UInt64),
    ));
    sample.members.push(Member::new(
        "f",
        16,
        WireType::Primitive(Primitive::Float32),
    ));
    sample.members.push(Member::new(
        "b",
        20,
        WireType::Primitive(Primitive::Bool),
    ));
    sample.members.push(Member::new("s", 24, WireType::Str));
    let id = set.define(sample).unwrap();
    (set, id)
}

proptest! {
    #[test]
    fn scalars_and_strings_roundtrip_in_both_formats(
        i in any::<i32>(),
        u in any::<u64>(),
        f in any::<f32>(),
        b in any::<bool>(),
        s in "[a-zA-Z0-9 ]{0,24}",
    ) {
        let (set, id) = scalar_schemas();
        let obj = Object::new(id);
        obj.borrow_mut().set("i", Value::Int(i as i64));
        obj.borrow_mut().set("u", Value::UInt(u));
        obj.borrow_mut().set("f", Value::F32(f));
        obj.borrow_mut().set("b", Value::Bool(b));
        obj.borrow_mut().set("s", Value::string(&s));
        let graph = Value::Object(obj);

        let blob = TaggedWriter::new(&set).pack_root(&graph).unwrap();
        let decoded = TaggedReader::new(&set, blob).unpack_root().unwrap();
        prop_assert_eq!(&decoded, &graph);

        for ptr in [PtrSize::Four, PtrSize::Eight] {
            let blob = PackedWriter::new(&set, ptr).pack_root(&graph).unwrap();
            let decoded = PackedReader::new(&set, blob).unpack_root().unwrap();
            prop_assert_eq!(&decoded, &graph);
        }
    }
}
