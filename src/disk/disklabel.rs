// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! OpenBSD disk labels.
//!
//! Growing an OpenBSD disk takes two label edits: the OpenBSD area boundaries
//! must be extended to the new end of the disk, then the last partition can be
//! resized into the freed space. Both edits are scripted through the
//! interactive `disklabel -E` editor.

use std::str::FromStr;

/// Single partition of a disk label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub letter: char,
    pub size: u64,
    pub offset: u64,
    pub fstype: String,
}

impl Partition {
    /// First sector behind partition, `None` if it lies beyond `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// Parsed `disklabel` output.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Disklabel {
    pub total_sectors: u64,
    pub boundstart: u64,
    pub boundend: u64,
    pub partitions: Vec<Partition>,
}

impl Disklabel {
    /// Partition furthest into the disk, ignoring raw partition "c".
    pub fn last_partition(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .filter(|partition| partition.letter != 'c' && partition.fstype != "unused")
            .max_by_key(|partition| partition.offset)
    }

    /// Whether there is free space beyond bounds or last partition.
    pub fn can_grow(&self) -> bool {
        let end = self
            .last_partition()
            .map_or(Some(0), Partition::end)
            .unwrap_or(u64::MAX);
        self.boundend < self.total_sectors || end < self.boundend
    }
}

/// Editor script for `disklabel -E` that grows target partition.
///
/// Resets OpenBSD bounds to the whole disk, then resizes the partition to all
/// space available behind it.
pub fn grow_script(letter: char) -> String {
    format!("b\n\n*\nc {letter}\n*\nw\nq\n")
}

impl FromStr for Disklabel {
    type Err = DisklabelError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut label = Disklabel::default();
        let mut seen_total = false;

        for (number, line) in data.lines().enumerate() {
            let line = line.trim();
            let syntax = || DisklabelError::Syntax { line: number + 1 };

            if let Some(value) = line.strip_prefix("total sectors:") {
                label.total_sectors = value.trim().parse().map_err(|_| syntax())?;
                seen_total = true;
            } else if let Some(value) = line.strip_prefix("boundstart:") {
                label.boundstart = value.trim().parse().map_err(|_| syntax())?;
            } else if let Some(value) = line.strip_prefix("boundend:") {
                label.boundend = value.trim().parse().map_err(|_| syntax())?;
            } else if let Some(partition) = parse_partition(line) {
                let partition = partition.ok_or_else(syntax)?;
                if partition.end().is_none() {
                    return Err(DisklabelError::Overflow {
                        line: number + 1,
                        letter: partition.letter,
                    });
                }
                label.partitions.push(partition);
            }
        }

        if !seen_total {
            return Err(DisklabelError::MissingTotal);
        }

        Ok(label)
    }
}

// INVARIANT: Partition rows look like "  a:  2097088  64  4.2BSD ..."
fn parse_partition(line: &str) -> Option<Option<Partition>> {
    let (letter, rest) = line.split_once(':')?;
    let mut chars = letter.chars();
    let letter = chars.next()?;
    if chars.next().is_some() || !letter.is_ascii_lowercase() {
        return None;
    }

    let mut fields = rest.split_whitespace();
    let partition = (|| {
        Some(Partition {
            letter,
            size: fields.next()?.parse().ok()?,
            offset: fields.next()?.parse().ok()?,
            fstype: fields.next()?.to_string(),
        })
    })();

    Some(partition)
}

/// Disk label error types.
#[derive(Debug, thiserror::Error)]
pub enum DisklabelError {
    #[error("malformed disklabel line {line}")]
    Syntax { line: usize },

    #[error("disklabel output has no total sector count")]
    MissingTotal,

    #[error("partition {letter} on line {line} ends beyond addressable sectors")]
    Overflow { line: usize, letter: char },
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const LABEL: &str = indoc! {"
        # /dev/rvnd0c:
        type: vnd
        disk: vnd device
        label: fictitious
        duid: 3b8e5a1c9d0f2e47
        flags:
        bytes/sector: 512
        sectors/track: 100
        tracks/cylinder: 1
        sectors/cylinder: 100
        cylinders: 83886
        total sectors: 8388608
        boundstart: 64
        boundend: 4194304

        16 partitions:
        #                size           offset  fstype [fsize bsize   cpg]
          a:          4194240               64  4.2BSD   2048 16384 12960 # /
          c:          8388608                0  unused
    "};

    #[test]
    fn parse_label() -> anyhow::Result<()> {
        let label: Disklabel = LABEL.parse()?;
        assert_eq!(label.total_sectors, 8388608);
        assert_eq!(label.boundstart, 64);
        assert_eq!(label.boundend, 4194304);
        assert_eq!(label.partitions.len(), 2);

        let last = label.last_partition();
        let expect = Partition {
            letter: 'a',
            size: 4194240,
            offset: 64,
            fstype: "4.2BSD".into(),
        };
        assert_eq!(last, Some(&expect));
        assert!(label.can_grow());

        Ok(())
    }

    #[test]
    fn last_partition_goes_by_offset() -> anyhow::Result<()> {
        let label: Disklabel = indoc! {"
            total sectors: 100
            boundstart: 0
            boundend: 100
              d:       40       60  4.2BSD
              a:       20        0  4.2BSD
              b:       40       20    swap
              c:      100        0  unused
        "}
        .parse()?;
        assert_eq!(label.last_partition().map(|p| p.letter), Some('d'));
        assert!(!label.can_grow());

        Ok(())
    }

    #[test]
    fn script_extends_bounds_then_partition() {
        assert_eq!(grow_script('a'), "b\n\n*\nc a\n*\nw\nq\n");
    }

    #[test]
    fn overflowing_partition_is_rejected() {
        let result = indoc! {"
            total sectors: 100
              a:  18446744073709551615       64  4.2BSD
        "}
        .parse::<Disklabel>();
        assert!(matches!(
            result,
            Err(DisklabelError::Overflow { line: 2, letter: 'a' })
        ));
    }

    #[test]
    fn missing_total_is_rejected() {
        let result = "boundstart: 64\n".parse::<Disklabel>();
        assert!(matches!(result, Err(DisklabelError::MissingTotal)));
    }
}
