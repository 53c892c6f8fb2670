//! Descriptor decoding against synthetic binary records.
//!
//! Blocks are assembled with the same relative-pointer encoding the
//! foreign compiler emits, then leaked, since the parsers hand out raw
//! addresses into them.

use std::ffi::c_void;

use swiftabi::{
    Metatype, NominalTypeDescriptor, ProtocolConformanceDescriptor, ValueWitnessTable,
};

fn put_u32(block: &mut [u8], at: usize, value: u32) {
    block[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_word(block: &mut [u8], at: usize, value: usize) {
    block[at..at + std::mem::size_of::<usize>()].copy_from_slice(&value.to_ne_bytes());
}

fn put_rel(block: &mut [u8], at: usize, target: usize) {
    let rel = target as i64 - at as i64;
    block[at..at + 4].copy_from_slice(&(rel as i32).to_ne_bytes());
}

fn put_rel_raw(block: &mut [u8], at: usize, target: usize, low_bit: bool) {
    let rel = (target as i64 - at as i64) as i32 | if low_bit { 1 } else { 0 };
    block[at..at + 4].copy_from_slice(&rel.to_ne_bytes());
}

fn put_str(block: &mut [u8], at: usize, text: &str) {
    block[at..at + text.len()].copy_from_slice(text.as_bytes());
    block[at + text.len()] = 0;
}

fn leak(block: Vec<u8>) -> &'static [u8] {
    Box::leak(block.into_boxed_slice())
}

#[test]
fn test_value_witness_table_decode() {
    let word = std::mem::size_of::<usize>();
    let mut block = Vec::with_capacity(8 * word + 2 * word + 8);
    for slot in 0..8usize {
        block.extend_from_slice(&(0x1000 + slot).to_ne_bytes());
    }
    block.extend_from_slice(&24usize.to_ne_bytes()); // size
    block.extend_from_slice(&24usize.to_ne_bytes()); // stride
    block.extend_from_slice(&0x0000_0007u32.to_ne_bytes()); // flags
    block.extend_from_slice(&0u32.to_ne_bytes()); // extra inhabitants

    let table = ValueWitnessTable::from_memory(leak(block).as_ptr() as *const c_void).unwrap();
    assert_eq!(table.size(), 24);
    assert_eq!(table.stride(), 24);
    assert_eq!(table.align_mask(), 7);
    assert_eq!(table.alignment(), 8);
    assert_eq!(table.extra_inhabitant_count(), 0);
}

#[test]
fn test_witness_table_sits_one_word_behind_the_metatype() {
    let word = std::mem::size_of::<usize>();

    // The witness block itself.
    let mut witness = Vec::new();
    for _ in 0..8usize {
        witness.extend_from_slice(&0usize.to_ne_bytes());
    }
    witness.extend_from_slice(&8usize.to_ne_bytes()); // size
    witness.extend_from_slice(&8usize.to_ne_bytes()); // stride
    witness.extend_from_slice(&3u32.to_ne_bytes()); // flags: align mask 3
    witness.extend_from_slice(&0u32.to_ne_bytes());
    let witness = leak(witness);

    // Metadata record: [witness pointer][discriminator word]. The metatype
    // handle is the discriminator's address.
    let mut meta = vec![0u8; 2 * word];
    put_word(&mut meta, 0, witness.as_ptr() as usize);
    put_word(&mut meta, word, 0x200);
    let meta = leak(meta);

    let metatype = Metatype::new(meta[word..].as_ptr() as *const c_void).unwrap();
    let table = ValueWitnessTable::from_type(metatype).unwrap();
    assert_eq!(table.size(), 8);
    assert_eq!(table.alignment(), 4);
}

#[test]
fn test_full_name_excludes_module_and_orders_outermost_first() {
    // Module at 0, then three nested struct contexts, strings at 128.
    let mut block = vec![0u8; 160];
    let positions = [0usize, 32, 64, 96];
    let names = [(128, "MyLib"), (134, "Outer"), (140, "Inner"), (146, "Innermost")];
    for (i, &pos) in positions.iter().enumerate() {
        put_u32(&mut block, pos, if i == 0 { 0 } else { 17 });
        if i > 0 {
            put_rel(&mut block, pos + 4, positions[i - 1]);
        }
        put_rel(&mut block, pos + 8, names[i].0);
        put_str(&mut block, names[i].0, names[i].1);
    }
    let block = leak(block);

    let innermost =
        NominalTypeDescriptor::new(block[96..].as_ptr() as *const c_void).unwrap();
    assert_eq!(innermost.full_name().unwrap(), "Outer.Inner.Innermost");
}

#[test]
fn test_resilient_witness_walk() {
    // Conformance with retroactive context, one conditional requirement,
    // and two resilient witnesses. Trailing sections:
    //   16 retroactive word
    //   20 conditional requirement (3 words)
    //   32 witness count
    //   36 entry 0: direct requirement + low-bit-masked name pointer
    //   44 entry 1: indirect requirement through the slot at 88
    let requirement_b: &'static u64 = Box::leak(Box::new(0));
    let mut block = vec![0u8; 128];
    put_u32(&mut block, 12, (1 << 6) | (1 << 8) | (1 << 16));
    put_u32(&mut block, 32, 2);
    put_rel_raw(&mut block, 36, 80, false);
    put_rel_raw(&mut block, 40, 96, true); // low bit masked off, not indirect
    put_rel_raw(&mut block, 44, 88, true); // low bit requests indirection
    put_rel_raw(&mut block, 48, 104, false);
    put_word(&mut block, 88, requirement_b as *const u64 as usize);
    put_str(&mut block, 96, "method0");
    put_str(&mut block, 104, "method1");
    let block = leak(block);

    let conformance =
        ProtocolConformanceDescriptor::new(block.as_ptr() as *const c_void).unwrap();
    let flags = conformance.flags().unwrap();
    assert!(flags.is_retroactive());
    assert_eq!(flags.conditional_requirement_count(), 1);
    assert!(flags.has_resilient_witnesses());

    let witnesses = conformance.resilient_witnesses().unwrap();
    assert_eq!(witnesses.len(), 2);
    assert_eq!(witnesses[0].requirement as usize, block.as_ptr() as usize + 80);
    assert_eq!(witnesses[0].mangled_name, "method0");
    assert_eq!(witnesses[1].requirement, requirement_b as *const u64 as *const c_void);
    assert_eq!(witnesses[1].mangled_name, "method1");
}

#[test]
fn test_conformance_without_resilient_section_is_empty() {
    let mut block = vec![0u8; 32];
    put_u32(&mut block, 12, 1 << 6);
    let conformance =
        ProtocolConformanceDescriptor::new(leak(block).as_ptr() as *const c_void).unwrap();
    assert!(conformance.resilient_witnesses().unwrap().is_empty());
}
