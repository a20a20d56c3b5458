use anyhow::{anyhow, Result};

use super::Consensus;

/// Take the first submission in worker id order.
pub struct FirstSubmission;

impl Consensus for FirstSubmission
{
    fn run(
        &self,
        params: &[Vec<u8>],
        extras: &[Option<Vec<u8>>],
    ) -> Result<(Vec<u8>, Option<Vec<u8>>)>
    {
        let param = params.first().ok_or(anyhow!("No params to choose from."))?;
        let extra = extras.first().cloned().flatten();
        Ok((param.clone(), extra))
    }
}

/// Take the parameter shared byte for byte by more than two thirds of the
/// submissions.
pub struct SuperMajority;

impl Consensus for SuperMajority
{
    fn run(
        &self,
        params: &[Vec<u8>],
        extras: &[Option<Vec<u8>>],
    ) -> Result<(Vec<u8>, Option<Vec<u8>>)>
    {
        let total = params.len();
        for (index, candidate) in params.iter().enumerate()
        {
            let votes = params.iter().filter(|p| *p == candidate).count();
            if 3 * votes > 2 * total
            {
                let extra = extras.get(index).cloned().flatten();
                return Ok((candidate.clone(), extra));
            }
        }
        Err(anyhow!(
            "No parameter reached a two thirds majority of {total} submissions."
        ))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn bytes(values: &[&str]) -> Vec<Vec<u8>>
    {
        values.iter().map(|v| v.as_bytes().to_vec()).collect()
    }

    fn extras(values: &[&str]) -> Vec<Option<Vec<u8>>>
    {
        values.iter().map(|v| Some(v.as_bytes().to_vec())).collect()
    }

    #[test]
    fn first_submission_wins()
    {
        let (param, extra) = FirstSubmission
            .run(&bytes(&["a", "b"]), &extras(&["x", "y"]))
            .unwrap();
        assert_eq!(param, b"a".to_vec());
        assert_eq!(extra, Some(b"x".to_vec()));

        let (_, extra) = FirstSubmission
            .run(&bytes(&["a"]), &[None])
            .unwrap();
        assert_eq!(extra, None);

        assert!(FirstSubmission.run(&[], &[]).is_err());
    }

    #[test]
    fn super_majority_needs_more_than_two_thirds()
    {
        let (param, extra) = SuperMajority
            .run(&bytes(&["b", "a", "a", "a"]), &extras(&["0", "1", "2", "3"]))
            .unwrap();
        assert_eq!(param, b"a".to_vec());
        assert_eq!(extra, Some(b"1".to_vec()));

        // exactly two thirds is not enough
        assert!(SuperMajority.run(&bytes(&["a", "a", "b"]), &[]).is_err());
        assert!(SuperMajority.run(&[], &[]).is_err());
    }
}
