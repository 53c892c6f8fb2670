//! Marshaler tests against the in-process stub runtime.

use std::ffi::c_void;
use std::sync::Arc;

use super::closure::ClosureRepresentation;
use super::*;
use crate::metadata::MetadataReader;
use crate::registry::{TypeRegistry, TypeTable};
use crate::testutil;
use crate::value::{ClosureParam, ClosureShape, ExistentialContainer, ForeignError, ManagedType, Value};

fn marshaler() -> Arc<ValueMarshaler> {
    let reader = Arc::new(MetadataReader::new(
        testutil::stub_runtime(),
        Arc::new(TypeTable::new()),
        Arc::new(TypeRegistry::new()),
    ));
    ValueMarshaler::new(reader)
}

fn round_trip(m: &ValueMarshaler, ty: &ManagedType, value: Value) {
    let mut buffer = vec![0u8; m.stride_of(ty).unwrap()];
    m.to_foreign(ty, &value, buffer.as_mut_ptr()).unwrap();
    let back = m.to_managed(buffer.as_ptr(), ty, true).unwrap();
    assert_eq!(back, value, "round trip of {ty}");
}

#[test]
fn test_scalar_round_trips() {
    let m = marshaler();
    round_trip(&m, &ManagedType::Bool, Value::Bool(true));
    round_trip(&m, &ManagedType::Bool, Value::Bool(false));
    round_trip(&m, &ManagedType::Int8, Value::Int8(-100));
    round_trip(&m, &ManagedType::UInt8, Value::UInt8(200));
    round_trip(&m, &ManagedType::Int16, Value::Int16(-30_000));
    round_trip(&m, &ManagedType::UInt16, Value::UInt16(60_000));
    round_trip(&m, &ManagedType::Int32, Value::Int32(i32::MIN));
    round_trip(&m, &ManagedType::UInt32, Value::UInt32(u32::MAX));
    round_trip(&m, &ManagedType::Int64, Value::Int64(i64::MAX));
    round_trip(&m, &ManagedType::UInt64, Value::UInt64(u64::MAX));
    round_trip(&m, &ManagedType::Float32, Value::Float32(3.5));
    round_trip(&m, &ManagedType::Float64, Value::Float64(-2.25e10));
}

#[test]
fn test_machine_width_round_trips() {
    let m = marshaler();
    round_trip(&m, &ManagedType::Int, Value::Int(isize::MIN + 1));
    round_trip(&m, &ManagedType::UInt, Value::UInt(usize::MAX - 7));
}

#[test]
fn test_trivial_enum_round_trips_as_tag() {
    let m = marshaler();
    let ty = ManagedType::TrivialEnum("Geo.Axis".into());
    round_trip(&m, &ty, Value::EnumCase(2));
    // Tags marshal as one machine word and release as a no-op.
    let mut buffer = vec![0u8; m.stride_of(&ty).unwrap()];
    m.to_foreign(&ty, &Value::EnumCase(1), buffer.as_mut_ptr()).unwrap();
    m.release_foreign_value(&ty, buffer.as_mut_ptr()).unwrap();
}

#[test]
fn test_tuple_round_trips_one_through_eight() {
    let m = marshaler();
    let elements = [
        (ManagedType::Int32, Value::Int32(11)),
        (ManagedType::Int64, Value::Int64(-22)),
        (ManagedType::Bool, Value::Bool(true)),
        (ManagedType::Float64, Value::Float64(0.5)),
        (ManagedType::UInt8, Value::UInt8(99)),
        (ManagedType::Int16, Value::Int16(-3)),
        (ManagedType::UInt, Value::UInt(404)),
        (ManagedType::Float32, Value::Float32(-8.25)),
    ];
    for n in 1..=8 {
        let ty = ManagedType::Tuple(elements[..n].iter().map(|(t, _)| t.clone()).collect());
        let value = Value::Tuple(elements[..n].iter().map(|(_, v)| v.clone()).collect());
        round_trip(&m, &ty, value);
    }
}

#[test]
fn test_wide_and_nested_tuples() {
    let m = marshaler();
    let wide_ty = ManagedType::Tuple(vec![ManagedType::Int8; 10]);
    let wide_value = Value::Tuple((0..10).map(|i| Value::Int8(i as i8)).collect());
    round_trip(&m, &wide_ty, wide_value);

    let nested_ty = ManagedType::Tuple(vec![
        ManagedType::Int32,
        ManagedType::Tuple(vec![ManagedType::Int64, ManagedType::Bool]),
        ManagedType::UInt16,
    ]);
    let nested_value = Value::Tuple(vec![
        Value::Int32(1),
        Value::Tuple(vec![Value::Int64(2), Value::Bool(false)]),
        Value::UInt16(3),
    ]);
    round_trip(&m, &nested_ty, nested_value);
}

#[test]
fn test_tuple_layout_mixed_widths() {
    let m = marshaler();
    let map = m
        .tuple_map(&[ManagedType::Int32, ManagedType::Int64, ManagedType::Int8])
        .unwrap();
    assert_eq!(map.offsets(), &[0, 8, 16]);
    assert_eq!(map.stride(), 24);
}

fn nominal_fixture(m: &ValueMarshaler) -> ManagedType {
    let ty = ManagedType::Nominal("Geo.Box".into());
    m.reader()
        .seed_nominal_metatype("Geo.Box", ty.clone(), testutil::fake_metatype());
    m.reader()
        .seed_witness_table(ty.clone(), testutil::stub_witness_table());
    ty
}

fn nominal_source(handle: *mut c_void, payload: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; testutil::STUB_NOMINAL_STRIDE];
    bytes[..std::mem::size_of::<usize>()].copy_from_slice(&(handle as usize).to_ne_bytes());
    bytes[8..16].copy_from_slice(&payload.to_ne_bytes());
    bytes
}

#[test]
fn test_nominal_copy_in_is_independent_and_balanced() {
    let m = marshaler();
    let ty = nominal_fixture(&m);
    let handle = testutil::new_object();
    let source = nominal_source(handle, 0xABCD);
    assert_eq!(testutil::refcount(handle), 1);

    let value = m.copy_in(&ty, &source).unwrap();
    // The copy owns its own reference to the embedded handle.
    assert_eq!(testutil::refcount(handle), 2);
    assert_eq!(value.bytes()[8..16], source[8..16]);

    drop(value);
    assert_eq!(testutil::refcount(handle), 1);
}

#[test]
fn test_nominal_round_trip_and_release() {
    let m = marshaler();
    let ty = nominal_fixture(&m);
    let handle = testutil::new_object();
    let source = nominal_source(handle, 7);

    // Borrowing marshal-in retains; the wrapper owns one reference.
    let value = m.to_managed(source.as_ptr(), &ty, false).unwrap();
    assert_eq!(testutil::refcount(handle), 2);

    let mut dest = vec![0u8; m.stride_of(&ty).unwrap()];
    m.to_foreign(&ty, &value, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 3);

    let back = m.to_managed(dest.as_ptr(), &ty, false).unwrap();
    assert_eq!(back, value);
    assert_eq!(testutil::refcount(handle), 4);

    // The single cleanup path destroys the marshaled-out copy.
    m.release_foreign_value(&ty, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 3);

    drop(back);
    drop(value);
    assert_eq!(testutil::refcount(handle), 1);
}

#[test]
fn test_nominal_retain_in_place_bumps_without_relocating() {
    let m = marshaler();
    let ty = nominal_fixture(&m);
    let handle = testutil::new_object();
    let mut buffer = nominal_source(handle, 12);

    m.retain_in_place(&ty, &mut buffer).unwrap();
    assert_eq!(testutil::refcount(handle), 2);
    // The value itself did not move or change.
    assert_eq!(buffer, nominal_source(handle, 12));

    m.destroy_value(&ty, &mut buffer).unwrap();
    assert_eq!(testutil::refcount(handle), 1);
}

#[test]
fn test_nominal_rejects_undersized_buffers() {
    let m = marshaler();
    let ty = nominal_fixture(&m);
    let small = vec![0u8; testutil::STUB_NOMINAL_STRIDE - 1];
    assert!(matches!(
        m.copy_in(&ty, &small),
        Err(crate::error::Error::Validation(_))
    ));
    let mut small = small;
    assert!(m.retain_in_place(&ty, &mut small).is_err());
    assert!(m.destroy_value(&ty, &mut small).is_err());
}

#[test]
fn test_object_round_trip_dedups_and_balances() {
    let m = marshaler();
    let ty = ManagedType::Object("Shapes.Canvas".into());
    let handle = testutil::new_object();

    // Wrap the instance the way an inbound call result would arrive.
    let raw = (handle as usize).to_ne_bytes();
    let value = m.to_managed(raw.as_ptr(), &ty, false).unwrap();
    assert_eq!(testutil::refcount(handle), 2);
    let before_cycle = testutil::refcount(handle);

    // One to_foreign -> to_managed(false) -> release cycle must leave the
    // count where it started.
    let mut dest = vec![0u8; m.stride_of(&ty).unwrap()];
    m.to_foreign(&ty, &value, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), before_cycle + 1);
    let again = m.to_managed(dest.as_ptr(), &ty, false).unwrap();
    assert_eq!(again, value);
    m.release_foreign_value(&ty, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), before_cycle);

    drop(value);
    drop(again);
    assert_eq!(testutil::refcount(handle), 1);
}

#[test]
fn test_tuple_release_recurses_per_element() {
    let m = marshaler();
    let ty = ManagedType::Tuple(vec![
        ManagedType::Object("Shapes.Canvas".into()),
        ManagedType::Int32,
    ]);
    let handle = testutil::new_object();
    let raw = (handle as usize).to_ne_bytes();
    let object = m
        .to_managed(raw.as_ptr(), &ManagedType::Object("Shapes.Canvas".into()), false)
        .unwrap();
    let value = Value::Tuple(vec![object, Value::Int32(5)]);

    let mut dest = vec![0u8; m.stride_of(&ty).unwrap()];
    m.to_foreign(&ty, &value, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 3);
    m.release_foreign_value(&ty, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 2);
}

#[test]
fn test_error_value_round_trip() {
    let m = marshaler();
    let handle = testutil::new_object();
    let value = Value::Error(ForeignError::new(handle as usize));

    let mut dest = vec![0u8; m.stride_of(&ManagedType::Error).unwrap()];
    m.to_foreign(&ManagedType::Error, &value, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 2);

    let back = m.to_managed(dest.as_ptr(), &ManagedType::Error, false).unwrap();
    assert_eq!(back, value);
    if let Value::Error(err) = &back {
        assert_eq!(err.description(m.runtime()), "stub error");
    }

    m.release_foreign_value(&ManagedType::Error, dest.as_mut_ptr()).unwrap();
    assert_eq!(testutil::refcount(handle), 1);
}

#[test]
fn test_existential_round_trip_and_payload() {
    let m = marshaler();
    let ty = ManagedType::Protocol("Shapes.Drawable".into());
    let metatype = testutil::fake_metatype();
    m.reader().registry().record(metatype, ManagedType::UInt);

    let container = ExistentialContainer {
        data: [42, 0, 0],
        metatype,
        witnesses: vec![0x7777],
    };
    round_trip(&m, &ty, Value::Existential(container.clone()));

    // The stub glue projects the first data word as the inline payload.
    assert_eq!(m.existential_payload(&container).unwrap(), Value::UInt(42));
}

#[test]
fn test_existential_payload_requires_registration() {
    let m = marshaler();
    let container = ExistentialContainer {
        data: [0, 0, 0],
        metatype: testutil::fake_metatype(),
        witnesses: vec![],
    };
    assert!(matches!(
        m.existential_payload(&container),
        Err(crate::error::Error::UnknownForeignType(_))
    ));
}

unsafe extern "C" fn stub_func_map2(
    rep: ClosureRepresentation,
    _m1: crate::metadata::Metatype,
    _m2: crate::metadata::Metatype,
    _result: crate::metadata::Metatype,
) -> BlindClosureRepresentation {
    BlindClosureRepresentation {
        function: rep.function,
        context: rep.context,
    }
}

unsafe extern "C" fn stub_action_map0(rep: ClosureRepresentation) -> BlindClosureRepresentation {
    BlindClosureRepresentation {
        function: rep.function,
        context: rep.context,
    }
}

unsafe extern "C" fn stub_invoke_function1(
    _rep: BlindClosureRepresentation,
    ret: *mut u8,
    args: *mut u8,
    _m1: crate::metadata::Metatype,
    _result: crate::metadata::Metatype,
) {
    let input = (args as *const i32).read_unaligned();
    (ret as *mut i64).write_unaligned(input as i64 * 2);
}

fn seed_closure_metatypes(m: &ValueMarshaler) {
    for ty in [ManagedType::Int32, ManagedType::Int64] {
        m.reader().seed_standard_metatype(ty, testutil::fake_metatype());
    }
}

#[test]
fn test_closure_outbound_invoke_and_identity() {
    let m = marshaler();
    seed_closure_metatypes(&m);
    m.runtime()
        .install_glue_symbol("swiftabi_funcMap2", stub_func_map2 as *const c_void);

    let shape = ClosureShape {
        params: vec![
            ClosureParam::plain(ManagedType::Int32),
            ClosureParam::plain(ManagedType::Int32),
        ],
        result: Some(Box::new(ManagedType::Int64)),
    };
    let ty = ManagedType::Closure(shape);
    let callable = ManagedCallable::new(|args| {
        let (Value::Int32(a), Value::Int32(b)) = (&args[0], &args[1]) else {
            panic!("unexpected closure arguments: {args:?}");
        };
        Ok(Some(Value::Int64((*a as i64) + (*b as i64))))
    });

    let mut dest = vec![0u8; m.stride_of(&ty).unwrap()];
    m.to_foreign(&ty, &Value::Closure(callable.clone()), dest.as_mut_ptr())
        .unwrap();

    // Invoke the way the foreign side would: through the emitted code
    // pointer with a packed argument buffer and a result slot.
    let word = std::mem::size_of::<usize>();
    let code = usize::from_ne_bytes(dest[..word].try_into().unwrap());
    let context = usize::from_ne_bytes(dest[word..2 * word].try_into().unwrap());
    type Trampoline = unsafe extern "C" fn(*mut u8, *mut u8, *mut c_void);
    let trampoline = unsafe { std::mem::transmute::<usize, Trampoline>(code) };
    let mut args = [0u8; 8];
    args[..4].copy_from_slice(&7i32.to_ne_bytes());
    args[4..].copy_from_slice(&35i32.to_ne_bytes());
    let mut ret = [0u8; 8];
    unsafe { trampoline(ret.as_mut_ptr(), args.as_mut_ptr(), context as *mut c_void) };
    assert_eq!(i64::from_ne_bytes(ret), 42);

    // Round-tripping the closure value yields the identical callable.
    let back = m.to_managed(dest.as_ptr(), &ty, true).unwrap();
    assert_eq!(back, Value::Closure(callable));
}

#[test]
fn test_action_closure_invoke() {
    let m = marshaler();
    m.runtime()
        .install_glue_symbol("swiftabi_actionMap0", stub_action_map0 as *const c_void);

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let seen = Arc::clone(&fired);
    let callable = ManagedCallable::new(move |args| {
        assert!(args.is_empty());
        seen.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(None)
    });
    let shape = ClosureShape {
        params: vec![],
        result: None,
    };
    let blind = m.bridge().build_foreign_closure(&callable, &shape).unwrap();

    type Trampoline = unsafe extern "C" fn(*mut u8, *mut c_void);
    let trampoline =
        unsafe { std::mem::transmute::<*const c_void, Trampoline>(blind.function) };
    unsafe { trampoline(std::ptr::null_mut(), blind.context) };
    assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn test_closure_unwrap_proxies_foreign_code() {
    let m = marshaler();
    seed_closure_metatypes(&m);
    m.runtime().install_glue_symbol(
        "swiftabi_invokeFunction1",
        stub_invoke_function1 as *const c_void,
    );

    let shape = ClosureShape {
        params: vec![ClosureParam::plain(ManagedType::Int32)],
        result: Some(Box::new(ManagedType::Int64)),
    };
    let rep = BlindClosureRepresentation {
        function: testutil::new_object() as *const c_void,
        context: testutil::new_object(),
    };

    let callable = m.bridge().unwrap_foreign_closure(rep, &shape).unwrap();
    let result = callable.invoke(&[Value::Int32(21)]).unwrap();
    assert_eq!(result, Some(Value::Int64(42)));

    // Unwrapping the same context pointer preserves identity.
    let again = m.bridge().unwrap_foreign_closure(rep, &shape).unwrap();
    assert_eq!(callable, again);
}

#[test]
fn test_closure_arity_limit() {
    let m = marshaler();
    let shape = ClosureShape {
        params: vec![ClosureParam::plain(ManagedType::Int32); MAX_CLOSURE_ARITY + 1],
        result: None,
    };
    let callable = ManagedCallable::new(|_| Ok(None));
    assert!(matches!(
        m.bridge().build_foreign_closure(&callable, &shape),
        Err(crate::error::Error::UnsupportedMarshal(_))
    ));
}

#[test]
fn test_exception_record_layout() {
    let m = marshaler();
    let word = std::mem::size_of::<usize>();
    let record = m.exception_record(&ManagedType::Int32).unwrap();

    let error_offset = (4 + word - 1) / word * word;
    assert_eq!(record.result_offset(), 0);
    assert_eq!(record.error_offset(), error_offset);
    assert_eq!(record.flag_offset(), error_offset + word);
    let payload_end = record.flag_offset() + 1;
    assert_eq!(record.stride(), (payload_end + word - 1) / word * word);
}

#[test]
fn test_exception_record_success_path() {
    let m = marshaler();
    let record = m.exception_record(&ManagedType::Int32).unwrap();
    let mut buffer = vec![0xffu8; record.stride()];

    m.set_success(&record, buffer.as_mut_ptr(), Some(&Value::Int32(1234)))
        .unwrap();
    assert!(!m.contains_error(&record, buffer.as_ptr()));
    let value = m.extract_result(&record, buffer.as_ptr()).unwrap();
    assert_eq!(value, Value::Int32(1234));
}

#[test]
fn test_exception_record_error_path() {
    let m = marshaler();
    let record = m.exception_record(&ManagedType::Int32).unwrap();
    let mut buffer = vec![0u8; record.stride()];
    let handle = testutil::new_object();

    m.set_error(&record, buffer.as_mut_ptr(), &ForeignError::new(handle as usize));
    assert!(m.contains_error(&record, buffer.as_ptr()));
    let err = m.extract_result(&record, buffer.as_ptr()).unwrap_err();
    assert!(err.is_foreign_exception());
    match err {
        crate::error::Error::ForeignException {
            handle: raised,
            description,
        } => {
            assert_eq!(raised, handle as usize);
            assert_eq!(description, "stub error");
        }
        other => panic!("expected ForeignException, got {other:?}"),
    }
}

#[test]
fn test_type_value_mismatch_is_rejected() {
    let m = marshaler();
    let mut buffer = vec![0u8; 8];
    let err = m
        .to_foreign(&ManagedType::Int32, &Value::Bool(true), buffer.as_mut_ptr())
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::Validation(_)));
}

#[test]
fn test_closure_release_is_refused() {
    let m = marshaler();
    let ty = ManagedType::Closure(ClosureShape {
        params: vec![],
        result: None,
    });
    let mut buffer = vec![0u8; 16];
    assert!(matches!(
        m.release_foreign_value(&ty, buffer.as_mut_ptr()),
        Err(crate::error::Error::UnsupportedMarshal(_))
    ));
}
