use std::{cmp, convert::TryFrom};

use super::*;

#[test]
fn test_numeric_keys() {
    assert_eq!(u64::feature_len(), 1);
    assert_eq!(10_u64.feature(0), 10.0);
    assert_eq!(u64::min_key(), u64::MIN);
    assert_eq!(u64::max_key(), u64::MAX);
    assert!(u64::EXPANDABLE);

    assert_eq!(i64::min_key(), i64::MIN);
    assert_eq!((-5_i64).feature(0), -5.0);
}

#[test]
fn test_byte_key() {
    let apple = ByteKey::<8>::try_from("apple").unwrap();
    let banana = ByteKey::<8>::try_from("banana").unwrap();
    let applea = ByteKey::<8>::try_from("applea").unwrap();

    assert!(apple < banana);
    assert!(apple < applea);
    assert!(!ByteKey::<8>::EXPANDABLE);
    assert_eq!(ByteKey::<8>::feature_len(), 8);
    assert_eq!(apple.feature(0), 97.0);
    assert_eq!(apple.feature(5), 0.0);

    assert_eq!(apple.as_bytes(), &[97, 112, 112, 108, 101, 0, 0, 0]);
    assert_eq!(format!("{:?}", apple), r#"bytekey<8>("apple")"#);

    assert!(ByteKey::<4>::try_from("toolong").is_err());
    assert_eq!(ByteKey::<4>::min_key().as_bytes(), &[0, 0, 0, 0]);
    assert_eq!(ByteKey::<4>::max_key().as_bytes(), &[255, 255, 255, 255]);
}

#[test]
fn test_feature_cmp() {
    let a = ByteKey::<4>::try_from("aa").unwrap();
    let b = ByteKey::<4>::try_from("ab").unwrap();
    assert_eq!(feature_cmp(&a, &b), cmp::Ordering::Less);
    assert_eq!(feature_cmp(&b, &a), cmp::Ordering::Greater);
    assert_eq!(feature_cmp(&a, &a), cmp::Ordering::Equal);

    // ordering by features agrees with the key ordering.
    assert_eq!(feature_cmp(&a, &b), a.cmp(&b));
}
