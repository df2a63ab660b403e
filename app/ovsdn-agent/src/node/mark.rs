use ovsdn_core::tracker::Vnid;

/// Derives the packet mark identifying a namespace's egressing traffic: a
/// hex value that is never 0, never intersects the masquerade bit, and is
/// distinct from the value produced for any other valid VNID.
pub fn mark_for_vnid(vnid: Vnid, masquerade_bit: u32) -> String {
    let mut mark = vnid;
    if mark == 0 {
        mark = 0xff00_0000;
    }
    if mark & masquerade_bit != 0 {
        mark = (mark | 0x0100_0000) ^ masquerade_bit;
    }
    format!("{mark:#010x}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn mark_value(vnid: Vnid, masquerade_bit: u32) -> u32 {
        let rendered = mark_for_vnid(vnid, masquerade_bit);
        u32::from_str_radix(rendered.trim_start_matches("0x"), 16).unwrap()
    }

    #[test]
    fn renders_eight_hex_digits() {
        assert_eq!(mark_for_vnid(42, 0), "0x0000002a");
        assert_eq!(mark_for_vnid(0, 0), "0xff000000");
        assert_eq!(mark_for_vnid(0xdeadbeef, 0), "0xdeadbeef");
    }

    #[test]
    fn never_intersects_the_masquerade_bit() {
        for bit in 0..32u32 {
            let masquerade_bit = 1 << bit;
            for vnid in [0, 1, 42, 0xff, masquerade_bit, 0xff00_0000, u32::MAX] {
                assert_eq!(
                    mark_value(vnid, masquerade_bit) & masquerade_bit,
                    0,
                    "vnid {vnid:#x}, masquerade bit {masquerade_bit:#x}"
                );
            }
        }
    }

    #[test]
    fn stays_distinct_across_vnids() {
        let masquerade_bit = 1 << 0;
        let mut seen = HashSet::new();
        for vnid in 0..=65_535u32 {
            assert!(
                seen.insert(mark_for_vnid(vnid, masquerade_bit)),
                "vnid {vnid} collided"
            );
        }
    }
}
