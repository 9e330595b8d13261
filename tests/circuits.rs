use std::convert::Infallible;
use std::sync::Arc;

use beavy::bitvec::BitVector;
use beavy::channel::{Channel, SimpleChannel};
use beavy::gates::{and_gate, input_gate, inv_gate, output_gate, xor_gate};
use beavy::wire::WireRef;
use beavy::{Error, Executor, Provider, ALL_PARTIES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

/// One gate of a test circuit, with operands given as indices of earlier
/// entries. The circuit's last entry feeds the output gate.
#[derive(Debug, Clone, Copy)]
enum Op {
    Input { owner: usize, num_wires: usize },
    Xor(usize, usize),
    And(usize, usize),
    Inv(usize),
}

fn bits(s: &str) -> BitVector {
    s.chars().map(|c| c == '1').collect()
}

/// Builds and runs the circuit at one party; every party calls this with
/// the same `ops`, `all_inputs` and `output_owner`.
async fn run_party<C: Channel + 'static>(
    channel: C,
    my_id: usize,
    num_parties: usize,
    num_simd: usize,
    ops: Vec<Op>,
    all_inputs: Vec<Vec<BitVector>>,
    output_owner: usize,
) -> Result<Option<Vec<BitVector>>, Error> {
    let provider = Provider::setup(channel, my_id, num_parties).await?;
    let mut executor = Executor::new(Arc::clone(&provider));
    let mut wires: Vec<Vec<WireRef>> = Vec::with_capacity(ops.len());
    let mut input_idx = 0;
    for op in &ops {
        match *op {
            Op::Input { owner, num_wires } => {
                let (gate, promise, outputs) = input_gate(&provider, owner, num_wires, num_simd)?;
                executor.add_gate(gate);
                if let Some(promise) = promise {
                    promise
                        .send(all_inputs[input_idx].clone())
                        .expect("gate holds the receiver");
                }
                input_idx += 1;
                wires.push(outputs);
            }
            Op::Xor(a, b) => {
                let (gate, outputs) = xor_gate(&provider, wires[a].clone(), wires[b].clone())?;
                executor.add_gate(gate);
                wires.push(outputs);
            }
            Op::And(a, b) => {
                let (gate, outputs) = and_gate(&provider, wires[a].clone(), wires[b].clone())?;
                executor.add_gate(gate);
                wires.push(outputs);
            }
            Op::Inv(a) => {
                let (gate, outputs) = inv_gate(&provider, wires[a].clone())?;
                executor.add_gate(gate);
                wires.push(outputs);
            }
        }
    }
    let last = wires.last().expect("circuit has at least one gate").clone();
    let (gate, output) = output_gate(&provider, last, output_owner)?;
    executor.add_gate(gate);
    executor.run().await?;
    match output {
        Some(future) => Ok(Some(future.await.map_err(|_| Error::ProtocolFailure)?)),
        None => Ok(None),
    }
}

async fn simulate2(
    num_simd: usize,
    ops: Vec<Op>,
    all_inputs: Vec<Vec<BitVector>>,
    output_owner: usize,
) -> Result<(Option<Vec<BitVector>>, Option<Vec<BitVector>>), Error> {
    let mut channels = SimpleChannel::channels(2);
    let c1 = channels.pop().expect("two channels");
    let c0 = channels.pop().expect("two channels");
    futures::try_join!(
        run_party(c0, 0, 2, num_simd, ops.clone(), all_inputs.clone(), output_owner),
        run_party(c1, 1, 2, num_simd, ops, all_inputs, output_owner),
    )
}

#[tokio::test]
async fn single_input_revealed_to_all() -> Result<(), Error> {
    let ops = vec![Op::Input {
        owner: 0,
        num_wires: 1,
    }];
    let inputs = vec![vec![bits("1011")]];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    assert_eq!(out0, Some(vec![bits("1011")]));
    assert_eq!(out1, Some(vec![bits("1011")]));
    Ok(())
}

#[tokio::test]
async fn xor_of_two_inputs() -> Result<(), Error> {
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Input {
            owner: 1,
            num_wires: 1,
        },
        Op::Xor(0, 1),
    ];
    let inputs = vec![vec![bits("1010")], vec![bits("0110")]];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    assert_eq!(out0, Some(vec![bits("1100")]));
    assert_eq!(out1, Some(vec![bits("1100")]));
    Ok(())
}

#[tokio::test]
async fn and_of_two_inputs() -> Result<(), Error> {
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Input {
            owner: 1,
            num_wires: 1,
        },
        Op::And(0, 1),
    ];
    let inputs = vec![vec![bits("1101")], vec![bits("1011")]];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    assert_eq!(out0, Some(vec![bits("1001")]));
    assert_eq!(out1, Some(vec![bits("1001")]));
    Ok(())
}

#[tokio::test]
async fn inverted_input() -> Result<(), Error> {
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Inv(0),
    ];
    let inputs = vec![vec![bits("0011")]];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    assert_eq!(out0, Some(vec![bits("1100")]));
    assert_eq!(out1, Some(vec![bits("1100")]));
    Ok(())
}

#[tokio::test]
async fn double_inversion_is_identity() -> Result<(), Error> {
    // both job assignments are exercised, the ids of the two INV gates
    // differ by one
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Inv(0),
        Op::Inv(1),
    ];
    let inputs = vec![vec![bits("0110")]];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    assert_eq!(out0, Some(vec![bits("0110")]));
    assert_eq!(out1, Some(vec![bits("0110")]));
    Ok(())
}

fn mixed_circuit() -> (Vec<Op>, Vec<Vec<BitVector>>, BitVector) {
    // y = (a & b) ^ !c
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::And(0, 1),
        Op::Inv(2),
        Op::Xor(3, 4),
    ];
    let inputs = vec![
        vec![bits("10101010")],
        vec![bits("11001100")],
        vec![bits("11110000")],
    ];
    (ops, inputs, bits("10000111"))
}

#[tokio::test]
async fn mixed_circuit_revealed_to_one_party() -> Result<(), Error> {
    let (ops, inputs, expected) = mixed_circuit();
    let (out0, out1) = simulate2(8, ops, inputs, 1).await?;
    assert_eq!(out0, None);
    assert_eq!(out1, Some(vec![expected]));
    Ok(())
}

#[tokio::test]
async fn multi_wire_bundles() -> Result<(), Error> {
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 2,
        },
        Op::Input {
            owner: 1,
            num_wires: 2,
        },
        Op::And(0, 1),
    ];
    let inputs = vec![
        vec![bits("1100"), bits("1010")],
        vec![bits("1111"), bits("0110")],
    ];
    let (out0, out1) = simulate2(4, ops, inputs, ALL_PARTIES).await?;
    let expected = Some(vec![bits("1100"), bits("0010")]);
    assert_eq!(out0, expected);
    assert_eq!(out1, expected);
    Ok(())
}

#[tokio::test]
async fn three_party_linear_circuit() -> Result<(), Error> {
    let ops = vec![
        Op::Input {
            owner: 0,
            num_wires: 1,
        },
        Op::Input {
            owner: 1,
            num_wires: 1,
        },
        Op::Input {
            owner: 2,
            num_wires: 1,
        },
        Op::Xor(0, 1),
        Op::Xor(3, 2),
        Op::Inv(4),
    ];
    let inputs = vec![vec![bits("1010")], vec![bits("0110")], vec![bits("0011")]];
    let expected = Some(vec![bits("0000")]);

    let mut channels = SimpleChannel::channels(3);
    let c2 = channels.pop().expect("three channels");
    let c1 = channels.pop().expect("three channels");
    let c0 = channels.pop().expect("three channels");
    let (out0, out1, out2) = futures::try_join!(
        run_party(c0, 0, 3, 4, ops.clone(), inputs.clone(), ALL_PARTIES),
        run_party(c1, 1, 3, 4, ops.clone(), inputs.clone(), ALL_PARTIES),
        run_party(c2, 2, 3, 4, ops, inputs, ALL_PARTIES),
    )?;
    assert_eq!(out0, expected);
    assert_eq!(out1, expected);
    assert_eq!(out2, expected);
    Ok(())
}

fn eval_directly(ops: &[Op], inputs: &[Vec<BitVector>]) -> Vec<BitVector> {
    let mut values: Vec<Vec<BitVector>> = vec![];
    let mut input_idx = 0;
    for op in ops {
        let v = match *op {
            Op::Input { .. } => {
                input_idx += 1;
                inputs[input_idx - 1].clone()
            }
            Op::Xor(a, b) => values[a]
                .iter()
                .zip(&values[b])
                .map(|(x, y)| x ^ y)
                .collect(),
            Op::And(a, b) => values[a]
                .iter()
                .zip(&values[b])
                .map(|(x, y)| x & y)
                .collect(),
            Op::Inv(a) => values[a].iter().map(|x| !x).collect(),
        };
        values.push(v);
    }
    values.last().expect("circuit has at least one gate").clone()
}

#[tokio::test]
async fn random_circuits_match_cleartext_evaluation() -> Result<(), Error> {
    let num_simd = 4;
    for seed in 0..10 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ops = vec![
            Op::Input {
                owner: 0,
                num_wires: 1,
            },
            Op::Input {
                owner: 1,
                num_wires: 1,
            },
        ];
        for i in 2..14 {
            let op = match rng.gen_range(0..4) {
                0 => Op::Xor(rng.gen_range(0..i), rng.gen_range(0..i)),
                1 => Op::And(rng.gen_range(0..i), rng.gen_range(0..i)),
                2 => Op::Inv(rng.gen_range(0..i)),
                _ => Op::Input {
                    owner: rng.gen_range(0..2),
                    num_wires: 1,
                },
            };
            ops.push(op);
        }
        let inputs: Vec<Vec<BitVector>> = ops
            .iter()
            .filter(|op| matches!(op, Op::Input { .. }))
            .map(|_| vec![BitVector::random_with(&mut rng, num_simd)])
            .collect();
        let expected = eval_directly(&ops, &inputs);

        let (out0, out1) = simulate2(num_simd, ops, inputs, ALL_PARTIES).await?;
        assert_eq!(out0, Some(expected.clone()), "seed {seed}");
        assert_eq!(out1, Some(expected), "seed {seed}");
    }
    Ok(())
}

#[tokio::test]
async fn mask_shares_reconstruct_the_masked_value() -> Result<(), Error> {
    // After the online phase, the mask shares of a wire must XOR to the
    // public share XOR the cleartext.
    async fn party(
        channel: SimpleChannel,
        my_id: usize,
    ) -> Result<(BitVector, BitVector, BitVector), Error> {
        let provider = Provider::setup(channel, my_id, 2).await?;
        let mut executor = Executor::new(Arc::clone(&provider));
        let (gate, promise_a, a) = input_gate(&provider, 0, 1, 4)?;
        executor.add_gate(gate);
        let (gate, promise_b, b) = input_gate(&provider, 1, 1, 4)?;
        executor.add_gate(gate);
        let (gate, y) = and_gate(&provider, a, b)?;
        executor.add_gate(gate);
        let (gate, output) = output_gate(&provider, y.clone(), ALL_PARTIES)?;
        executor.add_gate(gate);
        if let Some(promise) = promise_a {
            promise.send(vec![bits("1101")]).expect("gate alive");
        }
        if let Some(promise) = promise_b {
            promise.send(vec![bits("1011")]).expect("gate alive");
        }
        executor.run().await?;
        let cleartext = output
            .expect("all parties receive the output")
            .await
            .map_err(|_| Error::ProtocolFailure)?
            .remove(0);
        let secret = y[0].wait_setup().await.clone();
        let public = y[0].wait_online().await.clone();
        Ok((secret, public, cleartext))
    }

    let mut channels = SimpleChannel::channels(2);
    let c1 = channels.pop().expect("two channels");
    let c0 = channels.pop().expect("two channels");
    let ((s0, p0, out0), (s1, p1, out1)) = futures::try_join!(party(c0, 0), party(c1, 1))?;
    assert_eq!(out0, bits("1001"));
    assert_eq!(out1, bits("1001"));
    assert_eq!(p0, p1);
    assert_eq!(&s0 ^ &s1, &p0 ^ &out0);
    Ok(())
}

/// An in-memory channel that returns buffered messages in random order,
/// exercising the engine's tolerance to frame reordering.
struct ShufflingChannel {
    s: Vec<Option<mpsc::Sender<Vec<u8>>>>,
    r: Vec<Option<tokio::sync::Mutex<Shuffle>>>,
}

struct Shuffle {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<Vec<u8>>,
    rng: StdRng,
    delivered_first: bool,
}

impl ShufflingChannel {
    fn channels(parties: usize, seed: u64) -> Vec<Self> {
        let mut channels: Vec<Self> = (0..parties)
            .map(|_| ShufflingChannel {
                s: (0..parties).map(|_| None).collect(),
                r: (0..parties).map(|_| None).collect(),
            })
            .collect();
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (tx, rx) = mpsc::channel(1024);
                channels[a].s[b] = Some(tx);
                channels[b].r[a] = Some(tokio::sync::Mutex::new(Shuffle {
                    rx,
                    pending: vec![],
                    rng: StdRng::seed_from_u64(seed ^ ((a as u64) << 32) ^ b as u64),
                    delivered_first: false,
                }));
            }
        }
        channels
    }
}

impl Channel for ShufflingChannel {
    type SendError = mpsc::error::SendError<Vec<u8>>;
    type RecvError = Infallible;

    async fn send_bytes_to(&self, p: usize, msg: Vec<u8>) -> Result<(), Self::SendError> {
        self.s[p].as_ref().expect("connected").send(msg).await
    }

    async fn recv_bytes_from(&self, p: usize) -> Result<Option<Vec<u8>>, Infallible> {
        let mut shuffle = self.r[p].as_ref().expect("connected").lock().await;
        // the handshake seed is read off the channel before any message
        // slot exists, so the very first message must arrive in order
        if !shuffle.delivered_first {
            shuffle.delivered_first = true;
            return Ok(shuffle.rx.recv().await);
        }
        while let Ok(msg) = shuffle.rx.try_recv() {
            shuffle.pending.push(msg);
        }
        if shuffle.pending.is_empty() {
            match shuffle.rx.recv().await {
                Some(msg) => shuffle.pending.push(msg),
                None => return Ok(None),
            }
            while let Ok(msg) = shuffle.rx.try_recv() {
                shuffle.pending.push(msg);
            }
        }
        let len = shuffle.pending.len();
        let i = shuffle.rng.gen_range(0..len);
        Ok(Some(shuffle.pending.swap_remove(i)))
    }
}

#[tokio::test]
async fn reordered_frames_produce_the_same_outputs() -> Result<(), Error> {
    let (ops, inputs, expected) = mixed_circuit();
    for seed in 0..10 {
        let mut channels = ShufflingChannel::channels(2, seed);
        let c1 = channels.pop().expect("two channels");
        let c0 = channels.pop().expect("two channels");
        let (out0, out1) = futures::try_join!(
            run_party(c0, 0, 2, 8, ops.clone(), inputs.clone(), 1),
            run_party(c1, 1, 2, 8, ops.clone(), inputs.clone(), 1),
        )?;
        assert_eq!(out0, None);
        assert_eq!(out1, Some(vec![expected.clone()]), "seed {seed}");
    }
    Ok(())
}
