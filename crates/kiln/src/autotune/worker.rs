//! Worker-side serve loop.
//!
//! The worker binary reads framed jobs from stdin, executes them through the
//! installed [`JobHandler`], and writes framed outcomes to stdout. Panics and
//! errors are captured into text and shipped back as [`JobOutcome::Err`];
//! nothing a job does short of aborting the process can break the loop.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::protocol::{read_frame, write_frame, JobOutcome, SHUTDOWN_JOB_ID};
use super::JobHandler;

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("worker panicked: {text}")
    } else {
        "worker panicked".to_string()
    }
}

fn run_job(handler: &dyn JobHandler, payload: &[u8]) -> JobOutcome {
    match catch_unwind(AssertUnwindSafe(|| handler.run(payload))) {
        Ok(Ok(bytes)) => JobOutcome::Ok(bytes),
        Ok(Err(err)) => JobOutcome::Err(format!("{err:#}")),
        Err(panic) => JobOutcome::Err(panic_text(panic)),
    }
}

/// Serves jobs until the shutdown sentinel arrives or the input pipe closes.
///
/// An empty payload is the readiness probe and is acknowledged without
/// consulting the handler.
pub fn serve<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    handler: &dyn JobHandler,
) -> std::io::Result<()> {
    while let Some((job_id, payload)) = read_frame(&mut reader)? {
        if job_id < 0 {
            break;
        }
        let outcome = if payload.is_empty() {
            JobOutcome::Ok(Vec::new())
        } else {
            run_job(handler, &payload)
        };
        let encoded = bincode::serialize(&outcome)
            .unwrap_or_else(|err| {
                bincode::serialize(&JobOutcome::Err(format!("encode failed: {err}")))
                    .expect("encoding a plain string outcome cannot fail")
            });
        write_frame(&mut writer, job_id, &encoded)?;
    }
    // Acknowledge shutdown so the parent can distinguish a clean exit.
    let _ = write_frame(&mut writer, SHUTDOWN_JOB_ID, &[]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct EchoHandler;

    impl JobHandler for EchoHandler {
        fn run(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
            if payload == b"fail" {
                anyhow::bail!("job refused");
            }
            if payload == b"panic" {
                panic!("deliberate test panic");
            }
            Ok(payload.to_vec())
        }
    }

    fn roundtrip(frames: &[(i64, &[u8])]) -> Vec<(i64, JobOutcome)> {
        let mut input = Vec::new();
        for (job_id, payload) in frames {
            write_frame(&mut input, *job_id, payload).unwrap();
        }
        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output, &EchoHandler).unwrap();

        let mut cursor = Cursor::new(output);
        let mut replies = Vec::new();
        while let Some((job_id, payload)) = read_frame(&mut cursor).unwrap() {
            if job_id < 0 {
                break;
            }
            replies.push((job_id, bincode::deserialize(&payload).unwrap()));
        }
        replies
    }

    #[test]
    fn serves_jobs_and_acknowledges_shutdown() {
        let replies = roundtrip(&[(0, b"abc"), (1, b""), (SHUTDOWN_JOB_ID, b"")]);
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[0], (0, JobOutcome::Ok(bytes)) if bytes == b"abc"));
        assert!(matches!(&replies[1], (1, JobOutcome::Ok(bytes)) if bytes.is_empty()));
    }

    #[test]
    fn job_errors_become_text_outcomes() {
        let replies = roundtrip(&[(0, b"fail"), (SHUTDOWN_JOB_ID, b"")]);
        match &replies[0] {
            (0, JobOutcome::Err(text)) => assert!(text.contains("job refused")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn panics_are_captured_not_fatal() {
        let replies = roundtrip(&[(0, b"panic"), (1, b"ok"), (SHUTDOWN_JOB_ID, b"")]);
        match &replies[0] {
            (0, JobOutcome::Err(text)) => assert!(text.contains("deliberate test panic")),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(matches!(&replies[1], (1, JobOutcome::Ok(bytes)) if bytes == b"ok"));
    }
}
