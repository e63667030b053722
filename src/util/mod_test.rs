use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_bit_tricks() {
    assert_eq!(extract_rightmost_one(0b010100100), 0b000000100);
    assert_eq!(remove_rightmost_one(0b010100100), 0b010100000);
    assert_eq!(extract_rightmost_one(0), 0);
    assert_eq!(remove_rightmost_one(0), 0);
    assert_eq!(count_ones(0b010100100), 3);

    assert_eq!(bit_offset(0, 1), 0);
    assert_eq!(bit_offset(1, 1 << 10), 64 + 10);
}

#[test]
fn test_bitmap_ops() {
    let seed: u64 = random();
    println!("test_bitmap_ops seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let capacity = 1000;
    let mut bitmap = new_bitmap(capacity);
    assert_eq!(bitmap.len(), 16);

    let mut reference = vec![false; capacity];
    for _ in 0..10_000 {
        let pos = rng.gen::<usize>() % capacity;
        if rng.gen::<bool>() {
            set_bit(&mut bitmap, pos);
            reference[pos] = true;
        } else {
            unset_bit(&mut bitmap, pos);
            reference[pos] = false;
        }
    }

    for pos in 0..capacity {
        assert_eq!(check_bit(&bitmap, pos), reference[pos], "slot {}", pos);
    }

    let n: usize = reference.iter().filter(|x| **x).count();
    assert_eq!(count_bits_in_range(&bitmap, 0, capacity), n);

    for _ in 0..100 {
        let left = rng.gen::<usize>() % capacity;
        let right = left + (rng.gen::<usize>() % (capacity - left));
        let want = reference[left..right].iter().filter(|x| **x).count();
        assert_eq!(count_bits_in_range(&bitmap, left, right), want);
    }

    for _ in 0..100 {
        let pos = rng.gen::<usize>() % capacity;
        let want = (pos..capacity).find(|i| reference[*i]).unwrap_or(capacity);
        assert_eq!(next_set_slot(&bitmap, pos, capacity), want);
    }
}

#[test]
fn test_next_set_slot_empty() {
    let bitmap = new_bitmap(128);
    assert_eq!(next_set_slot(&bitmap, 0, 128), 128);
    assert_eq!(next_set_slot(&bitmap, 127, 128), 128);
    assert_eq!(next_set_slot(&bitmap, 128, 128), 128);
}
