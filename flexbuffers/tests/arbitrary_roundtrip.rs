//! Property-based round-trip coverage over arbitrary scalar trees, gated
//! behind the `arbitrary` feature the way the wider crate family carries it
//! as an optional, fuzz-oriented dependency rather than a default one.
#![cfg(feature = "arbitrary")]

use arbitrary::{Arbitrary, Unstructured};
use flexbuffers::{get_root_checked, Builder};

#[derive(Debug, Clone, Arbitrary)]
enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
}

fn push(builder: &mut Builder, scalar: &Scalar) {
    match scalar {
        Scalar::Null => builder.add_null().unwrap(),
        Scalar::Bool(b) => builder.add_bool(*b).unwrap(),
        Scalar::Int(i) => builder.add_int(*i).unwrap(),
        Scalar::UInt(u) => builder.add_uint(*u).unwrap(),
        Scalar::Double(d) => builder.add_double(*d).unwrap(),
        Scalar::Str(s) => builder.add_string(s).unwrap(),
        Scalar::Blob(b) => builder.add_blob(b).unwrap(),
    }
}

fn assert_round_trips(scalar: &Scalar, reference: &flexbuffers::Reference) {
    match scalar {
        Scalar::Null => assert!(reference.is_null()),
        Scalar::Bool(b) => assert_eq!(reference.as_bool(), *b),
        Scalar::Int(i) => assert_eq!(reference.as_i64(), *i),
        Scalar::UInt(u) => assert_eq!(reference.as_u64(), *u),
        Scalar::Double(d) => assert!(d.is_nan() || reference.as_f64() == *d),
        Scalar::Str(s) => assert_eq!(reference.as_str(), s.as_str()),
        Scalar::Blob(b) => assert_eq!(reference.as_blob(), b.as_slice()),
    }
}

fn fuzz_case(seed: &[u8]) {
    let mut u = Unstructured::new(seed);
    let Ok(scalars) = <Vec<Scalar> as Arbitrary>::arbitrary(&mut u) else {
        return;
    };
    if scalars.is_empty() {
        return;
    }

    let mut builder = Builder::new(64);
    let start = builder.start_vector();
    for s in &scalars {
        push(&mut builder, s);
    }
    builder.end_vector(start, false, false).unwrap();
    builder.finish().unwrap();

    let root = get_root_checked(builder.bytes()).unwrap();
    let vector = root.as_vector().unwrap();
    assert_eq!(vector.len(), scalars.len());
    for (i, scalar) in scalars.iter().enumerate() {
        assert_round_trips(scalar, &vector.index(i));
    }
}

#[test]
fn arbitrary_scalar_vectors_round_trip() {
    // A handful of fixed seeds rather than a corpus-driven fuzz loop: this
    // is a deterministic regression test, not a fuzz target (the `fuzz/`
    // harness, out of scope per spec.md §1, owns open-ended exploration).
    for seed in [
        &b"\x01\x00\x00\x00\x2a"[..],
        &b"\x03abc\x01\x01\xff\xff\xff\xff\xff\xff\xff\xff"[..],
        &b"\x02\x05hello\x00"[..],
        &[0u8; 32][..],
        &[0xffu8; 48][..],
    ] {
        fuzz_case(seed);
    }
}
