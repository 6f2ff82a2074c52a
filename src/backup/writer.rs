//! Category file naming and content layout.

use crate::backup::scripter::{ObjectCategory, ScriptedObject};
use std::io::{self, Write};

pub const BATCH_SEPARATOR: &str = "GO";

/// `001 Database.sql`, `002 Schemas.sql`, ...
pub fn category_file_name(sequence: usize, category: ObjectCategory) -> String {
    format!("{sequence:03} {category}.sql")
}

/// Writes the `USE` preamble (where the category has one) and every object's scripts.
///
/// System objects are skipped for categories that exclude them. Returns the number
/// of objects written.
pub fn write_category<W: Write>(
    writer: &mut W,
    database: &str,
    category: ObjectCategory,
    objects: &[ScriptedObject],
) -> io::Result<usize> {
    if category.has_use_preamble() {
        writeln!(writer, "USE [{database}]")?;
        writeln!(writer, "{BATCH_SEPARATOR}")?;
    }

    let mut written = 0;
    for object in objects {
        if object.is_system_object && category.skips_system_objects() {
            tracing::trace!("Skipping system object {}.{}", database, object.name);
            continue;
        }
        for script in &object.scripts {
            writeln!(writer, "{script}")?;
        }
        written += 1;
    }

    Ok(written)
}
