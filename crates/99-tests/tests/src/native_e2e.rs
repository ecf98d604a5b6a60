#![cfg(all(test, not(target_arch = "wasm32")))]

use anyhow::{Context, Result};
use rand::prelude::*;
use runtime_native::{
    EchoInterpreter, RuntimeResult, WorkerConfig, WorkerHost, WorkerIo, WorkerStatus,
};
use shared_channel::{archive, Envelope, FRAME_HEADER_LEN};

const REQUEST: Envelope = Envelope::new(0x21, 1);
const RESPONSE: Envelope = Envelope::new(0x22, 1);

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, PartialEq, Eq, Clone)]
enum Request {
    Add { id: u32, a: i64, b: i64 },
    Upper { id: u32, text: String },
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, PartialEq, Eq, Clone)]
enum Response {
    Sum { id: u32, value: i64 },
    Text { id: u32, text: String },
}

fn calculator(source: Option<&str>, io: &mut WorkerIo) -> RuntimeResult<()> {
    if let Some(source) = source {
        io.send(Envelope::new(0, 1), format!("ready:{source}").as_bytes())?;
    }
    while let Some(frame) = io.recv()? {
        let response = match frame.decode::<Request>()? {
            Request::Add { id, a, b } => Response::Sum { id, value: a + b },
            Request::Upper { id, text } => Response::Text {
                id,
                text: text.to_uppercase(),
            },
        };
        io.send(RESPONSE, &archive(&response)?)?;
    }
    Ok(())
}

fn config(capacity: usize) -> WorkerConfig {
    WorkerConfig::default()
        .with_name("e2e-worker")
        .with_channel_capacity(capacity)
}

#[test]
fn typed_requests_round_trip_through_worker() -> Result<()> {
    let mut host = WorkerHost::spawn(config(4096), calculator).context("spawn worker")?;
    host.run(Some("calc")).context("run")?;

    let ready = host.recv().context("ready banner")?;
    assert_eq!(ready.text()?, "ready:calc");
    assert_eq!(host.status(), WorkerStatus::Running { runs: 1 });

    for id in 0..200u32 {
        let request = if id % 2 == 0 {
            Request::Add {
                id,
                a: i64::from(id),
                b: -7,
            }
        } else {
            Request::Upper {
                id,
                text: format!("msg-{id}"),
            }
        };
        host.sender()
            .send_archived(REQUEST, &request)
            .with_context(|| format!("send request {id}"))?;

        let frame = host.recv().context("response")?;
        assert_eq!(frame.envelope, RESPONSE);
        let expected = match request {
            Request::Add { id, a, b } => Response::Sum { id, value: a + b },
            Request::Upper { id, text } => Response::Text {
                id,
                text: text.to_uppercase(),
            },
        };
        assert_eq!(frame.decode::<Response>()?, expected);
    }

    host.join().context("join worker")?;
    Ok(())
}

#[test]
fn echo_worker_survives_generation_switches() -> Result<()> {
    const CAPACITY: usize = 128;
    const WINDOW: usize = 3;
    const MAX_PAYLOAD: usize = CAPACITY / WINDOW - FRAME_HEADER_LEN;

    let mut host = WorkerHost::spawn(config(CAPACITY), EchoInterpreter).context("spawn")?;
    host.run(None).context("run")?;

    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for round in 0..500u32 {
        let batch: Vec<Vec<u8>> = (0..WINDOW)
            .map(|_| {
                let len = rng.gen_range(0..=MAX_PAYLOAD);
                (0..len).map(|_| rng.gen()).collect()
            })
            .collect();

        for (idx, payload) in batch.iter().enumerate() {
            host.send(Envelope::new(idx as u8, 1), payload)
                .with_context(|| format!("round {round} send {idx}"))?;
        }
        for (idx, payload) in batch.iter().enumerate() {
            let frame = host.recv().with_context(|| format!("round {round} recv {idx}"))?;
            assert_eq!(frame.envelope.tag, idx as u8);
            assert_eq!(&frame.payload, payload, "round {round} frame {idx}");
        }
    }

    host.join().context("join")?;
    Ok(())
}

#[test]
fn restarted_interpreter_keeps_the_same_channels() -> Result<()> {
    let one_shot = |source: Option<&str>, io: &mut WorkerIo| -> RuntimeResult<()> {
        let frame = io.recv()?;
        if let Some(frame) = frame {
            let reply = format!("{}:{}", source.unwrap_or("-"), frame.text()?);
            io.send(Envelope::new(0, 1), reply.as_bytes())?;
        }
        Ok(())
    };
    let mut host = WorkerHost::spawn(config(256), one_shot).context("spawn")?;

    for (run, word) in ["alpha", "beta", "gamma"].iter().enumerate() {
        host.run(Some(format!("run{run}").as_str())).context("run")?;
        host.send(Envelope::new(1, 1), word.as_bytes())?;
        let reply = host.recv()?;
        assert_eq!(reply.text()?, format!("run{run}:{word}"));
    }

    host.join().context("join")?;
    Ok(())
}

#[test]
#[ignore]
fn slow_echo_stress_large_arena() -> Result<()> {
    let mut host = WorkerHost::spawn(config(1 << 16), EchoInterpreter).context("spawn")?;
    host.run(None)?;

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200_000 {
        let len = rng.gen_range(1..=512);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        host.send(REQUEST, &payload)?;
        assert_eq!(host.recv()?.payload, payload);
    }

    host.join()?;
    Ok(())
}
