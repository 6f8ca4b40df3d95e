//! Memory/disk format normalization (spec §4.C). Accepts the formats
//! hypervisor configs are commonly authored in and emits the canonical
//! `<n>MiB`/`<n>GiB` the adapters pass to `lxc`/`incus`/`pct`/`qm`.

/// A bare number is interpreted as megabytes; `MB`/`MiB`/`M`/`m` are
/// treated as megabytes, `GB`/`GiB`/`G`/`g` as gigabytes, and (disk only)
/// `TB`/`TiB`/`T`/`t` as terabytes, normalized down to `<n>GiB`.
pub fn convert_memory_format(input: &str) -> String {
    let trimmed = input.trim();
    let Some((number, unit)) = split_number_and_unit(trimmed) else {
        return trimmed.to_string();
    };

    match unit.to_ascii_uppercase().as_str() {
        "" => format!("{}MiB", number as u64),
        "M" | "MB" | "MIB" => format!("{}MiB", number as u64),
        "G" | "GB" | "GIB" => format!("{}GiB", number as u64),
        "T" | "TB" | "TIB" => format!("{}GiB", (number * 1024.0) as u64),
        _ => trimmed.to_string(),
    }
}

fn split_number_and_unit(value: &str) -> Option<(f64, &str)> {
    let split_at = value.find(|c: char| c.is_alphabetic()).unwrap_or(value.len());
    let (number_part, unit) = value.split_at(split_at);
    let number: f64 = number_part.parse().ok()?;
    Some((number, unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_recognized_formats() {
        assert_eq!(convert_memory_format("512"), "512MiB");
        assert_eq!(convert_memory_format("512m"), "512MiB");
        assert_eq!(convert_memory_format("512M"), "512MiB");
        assert_eq!(convert_memory_format("512MB"), "512MiB");
        assert_eq!(convert_memory_format("512MiB"), "512MiB");
        assert_eq!(convert_memory_format("2G"), "2GiB");
        assert_eq!(convert_memory_format("2GB"), "2GiB");
        assert_eq!(convert_memory_format("2GiB"), "2GiB");
        assert_eq!(convert_memory_format("1TB"), "1024GiB");
    }

    #[test]
    fn is_idempotent_for_every_recognized_input() {
        for input in ["512", "512m", "512M", "512MB", "512MiB", "2G", "2GB", "2GiB", "1TB"] {
            let once = convert_memory_format(input);
            let twice = convert_memory_format(&once);
            assert_eq!(once, twice);
            assert!(once.ends_with("MiB") || once.ends_with("GiB") || once == input);
        }
    }

    #[test]
    fn leaves_unrecognized_input_unchanged() {
        assert_eq!(convert_memory_format("bogus"), "bogus");
    }
}
