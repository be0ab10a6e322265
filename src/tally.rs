//! Vote aggregation
//!
//! Pure tally computation shared by the live updates sent while a poll is
//! open and the final snapshot taken when it closes. Being side-effect-free
//! and deterministic, recomputing from the same answers always yields the
//! same result.

/// Counts votes per option
///
/// Every declared option starts at zero, so options nobody picked still
/// appear in the result. Answers referring to an option outside
/// `0..option_count` are ignored; they cannot introduce extra entries.
///
/// # Arguments
///
/// * `option_count` - Number of declared options
/// * `answers` - The chosen option index per answered respondent
///
/// # Returns
///
/// A vector of counts positionally aligned with the poll's options.
pub fn tally<I: IntoIterator<Item = usize>>(option_count: usize, answers: I) -> Vec<u64> {
    let mut counts = vec![0_u64; option_count];
    for answer in answers {
        if let Some(count) = counts.get_mut(answer) {
            *count += 1;
        }
    }
    counts
}
