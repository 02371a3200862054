use std::io;

use mit_vm_runtime::bytecode::WORD_BYTES;
use mit_vm_runtime::object::{native_endianness, read_header, write_object, ObjectError, MAGIC};
use mit_vm_runtime::{ExecutionConfig, Machine};

fn machine() -> Machine {
    Machine::new(ExecutionConfig {
        memory_bytes: 1024,
        stack_words: 16,
        ..ExecutionConfig::default()
    })
}

fn header(endianness: u8, word_size: u8, words: u64) -> Vec<u8> {
    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&[endianness, word_size]);
    bytes.extend_from_slice(&words.to_ne_bytes());
    bytes
}

#[test]
fn saved_image_loads_elsewhere() {
    let mut source = machine();
    for (index, value) in [11, -2, 0x7fff_0000, 42].into_iter().enumerate() {
        source.store_word(0x100 + 8 * index as u64, value).unwrap();
    }
    let mut image: Vec<u8> = Vec::new();
    source.save_object(0x100, 32, &mut image).unwrap();
    assert_eq!(image.len(), MAGIC.len() + 2 + WORD_BYTES + 32);

    let mut target = machine();
    let words = target.load_object(0x200, image.as_slice()).unwrap();
    assert_eq!(words, 4);
    assert_eq!(&target.memory()[0x200..0x220], &source.memory()[0x100..0x120]);
    assert_eq!(target.load_word(0x208), Ok(-2));
}

#[test]
fn interpreter_line_is_skipped() {
    let mut image = b"#!/usr/bin/env mit\n".to_vec();
    write_object(&mut image, &99i64.to_ne_bytes()).unwrap();

    let mut vm = machine();
    assert_eq!(vm.load_object(0, image.as_slice()).unwrap(), 1);
    assert_eq!(vm.load_word(0), Ok(99));
}

#[test]
fn truncated_header_leaves_memory_untouched() {
    let mut vm = machine();
    vm.memory_mut()[..4].copy_from_slice(b"keep");
    let before = vm.memory().to_vec();

    let error = vm.load_object(0, &b"MI"[..]).unwrap_err();
    assert!(matches!(error, ObjectError::HeaderInvalid));
    assert_eq!(error.code(), -2);
    assert_eq!(vm.memory(), before.as_slice());

    let error = vm.load_object(0, &b"#!no newline"[..]).unwrap_err();
    assert!(matches!(error, ObjectError::HeaderInvalid));
    assert_eq!(vm.memory(), before.as_slice());
}

#[test]
fn foreign_images_are_rejected() {
    let mut vm = machine();

    let mut bad_magic = header(native_endianness(), WORD_BYTES as u8, 0);
    bad_magic[0] = b'X';
    let error = vm.load_object(0, bad_magic.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::HeaderInvalid));

    let narrow = header(native_endianness(), 4, 0);
    let error = vm.load_object(0, narrow.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::WrongWordSize(4)));
    assert_eq!(error.code(), -5);

    let swapped = header(1 - native_endianness(), WORD_BYTES as u8, 0);
    let error = vm.load_object(0, swapped.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::WrongEndianness));
    assert_eq!(error.code(), -4);

    let unknown = header(7, WORD_BYTES as u8, 0);
    let error = vm.load_object(0, unknown.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::HeaderInvalid));
}

#[test]
fn short_data_is_truncated_and_not_written() {
    let mut image = header(native_endianness(), WORD_BYTES as u8, 4);
    image.extend_from_slice(&5i64.to_ne_bytes());

    let mut vm = machine();
    let error = vm.load_object(0, image.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::Truncated));
    assert_eq!(error.code(), -3);
    assert_eq!(vm.load_word(0), Ok(0));
}

#[test]
fn out_of_range_addresses_are_rejected() {
    let mut image: Vec<u8> = Vec::new();
    write_object(&mut image, &[0u8; 16]).unwrap();

    let mut vm = machine();
    let error = vm.load_object(1016, image.as_slice()).unwrap_err();
    assert!(matches!(
        error,
        ObjectError::InvalidAddressRange { address: 1016, len: 16 }
    ));
    assert_eq!(error.code(), -1);

    let error = vm.load_object(4, image.as_slice()).unwrap_err();
    assert!(matches!(error, ObjectError::InvalidAddressRange { .. }));

    let error = vm.save_object(0, 12, io::sink()).unwrap_err();
    assert!(matches!(error, ObjectError::InvalidAddressRange { .. }));
    let error = vm.save_object(1016, 16, io::sink()).unwrap_err();
    assert!(matches!(error, ObjectError::InvalidAddressRange { .. }));
}

#[test]
fn core_dump_covers_all_memory() {
    let mut vm = machine();
    vm.store_word(1016, -1).unwrap();
    let mut core: Vec<u8> = Vec::new();
    vm.dump_core(&mut core).unwrap();

    let mut reader = core.as_slice();
    assert_eq!(read_header(&mut reader).unwrap(), 128);
    assert_eq!(reader.len(), 1024);
    assert_eq!(&reader[1016..], &(-1i64).to_ne_bytes());
}
