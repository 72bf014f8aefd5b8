/// Index of a render job within a batch. Unique per batch.
pub type JobIndex = u64;

/// Number of digits used when zero-padding a job index.
pub const JOB_ID_WIDTH: usize = 5;

/// Zero-padded string form of a job index (`3` -> `"00003"`).
///
/// Used both as the COCO image/annotation id and in render file names.
pub fn job_id(index: JobIndex) -> String {
    format!("{index:0width$}", width = JOB_ID_WIDTH)
}

/// File stem of the render produced by job `index` (`render_00003`).
pub fn render_stem(index: JobIndex) -> String {
    format!("render_{}", job_id(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_zero_padded() {
        assert_eq!(job_id(3), "00003");
        assert_eq!(job_id(12345), "12345");
    }

    #[test]
    fn wide_indices_are_not_truncated() {
        assert_eq!(job_id(1_234_567), "1234567");
    }

    #[test]
    fn render_stem_uses_padded_id() {
        assert_eq!(render_stem(42), "render_00042");
    }
}
