//! End-to-end scenarios: N ranks as threads over the in-process transport,
//! writing through the in-memory driver.

use std::sync::Arc;
use std::thread;

use pario_backend_mem::{MemDriver, MemFs, IOTYPE_MEM};
use pario_core::comm::local::LocalComm;
use pario_core::driver::{OpenMode, UNLIMITED};
use pario_core::FileDriver;
use pario_core::error::{Error, ErrorHandler};
use pario_core::types::{bytes_to_i32s, i32s_to_bytes, PioType};
use pario_core::{CommType, FlowDir, FlowOpts, Pario, RearrOpts, Rearranger};

fn run_ranks<T, F>(size: usize, f: F) -> (Vec<T>, MemFs)
where
    T: Send + 'static,
    F: Fn(usize, LocalComm, MemFs) -> T + Send + Sync + 'static,
{
    let fs = MemFs::new();
    let comms = LocalComm::universe(size);
    let f = Arc::new(f);
    let handles: Vec<_> = comms
        .into_iter()
        .enumerate()
        .map(|(rank, c)| {
            let f = Arc::clone(&f);
            let fs = fs.clone();
            thread::spawn(move || f(rank, c, fs))
        })
        .collect();
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect();
    (results, fs)
}

fn new_context(comm: &LocalComm, fs: &MemFs, num_io: usize, stride: usize, rearr: Rearranger) -> (Pario, i32) {
    let mut pio = Pario::new();
    pio.set_default_error_handling(ErrorHandler::Return);
    pio.register_driver(IOTYPE_MEM, Box::new(MemDriver::new(fs.clone())));
    let sys = pio.init_intracomm(comm, num_io, stride, 0, rearr).unwrap();
    (pio, sys)
}

/// One non-record Int variable over a 1-D dimension.
fn simple_file(pio: &mut Pario, sys: i32, path: &str, len: i64) -> (i32, i32) {
    let ncid = pio
        .create_file(sys, IOTYPE_MEM, path, OpenMode::WRITE | OpenMode::CLOBBER)
        .unwrap();
    let dim = pio.def_dim(ncid, "x", len).unwrap();
    let varid = pio.def_var(ncid, "data", PioType::Int, &[dim]).unwrap();
    pio.enddef(ncid).unwrap();
    (ncid, varid)
}

#[test]
fn test_s1_cyclic_write() {
    let (results, fs) = run_ranks(4, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let (ncid, varid) = simple_file(&mut pio, sys, "s1.nc", 16);

        let r = rank as i64;
        let map: Vec<i64> = vec![r + 1, r + 5, r + 9, r + 13];
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[16], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = map.iter().map(|&g| g as i32).collect();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
            .unwrap();

        let d = pio.decomp(ioid).unwrap();
        let facts = (
            d.needs_sort,
            d.llen,
            d.regions
                .iter()
                .map(|r| (r.start.clone(), r.count.clone()))
                .collect::<Vec<_>>(),
            d.ioid,
            d.read_only,
        );
        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        facts
    });

    let data = bytes_to_i32s(&fs.var_data("s1.nc", "data").unwrap());
    assert_eq!(data, (1..=16).collect::<Vec<i32>>());

    // Rank 0 is the single I/O rank: llen 16, one region [0..16).
    assert_eq!(results[0].1, 16);
    assert_eq!(results[0].2, vec![(vec![0], vec![16])]);
    for r in &results {
        assert!(!r.0);
        assert!(!r.4);
        // Id agreement across ranks.
        assert_eq!(r.3, results[0].3);
    }
}

#[test]
fn test_s2_block_write_no_sort() {
    let (results, fs) = run_ranks(4, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let (ncid, varid) = simple_file(&mut pio, sys, "s2.nc", 16);

        let r = rank as i64;
        let map: Vec<i64> = (4 * r + 1..=4 * r + 4).collect();
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[16], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = map.iter().map(|&g| g as i32).collect();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
            .unwrap();

        let d = pio.decomp(ioid).unwrap();
        let facts = (d.needs_sort, d.scount.clone());
        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        facts
    });

    let data = bytes_to_i32s(&fs.var_data("s2.nc", "data").unwrap());
    assert_eq!(data, (1..=16).collect::<Vec<i32>>());
    for (needs_sort, scount) in results {
        assert!(!needs_sort);
        assert_eq!(scount, vec![4]);
    }
}

fn hole_filling(rearr: Rearranger) -> (Vec<(bool, usize, i64)>, MemFs) {
    run_ranks(4, move |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, rearr);
        let (ncid, varid) = simple_file(&mut pio, sys, "s3.nc", 8);

        let map: Vec<i64> = match rank {
            0 => vec![1],
            1 => vec![3],
            _ => vec![0],
        };
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = match rank {
            0 => vec![10],
            1 => vec![30],
            _ => vec![0],
        };
        let fill = (-1i32).to_le_bytes();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), Some(&fill), true)
            .unwrap();

        let d = pio.decomp(ioid).unwrap();
        let data_elems: i64 = d.regions.iter().map(|r| r.nelems()).sum();
        let fill_elems: i64 = d.fill_regions.iter().map(|r| r.nelems()).sum();
        let facts = (d.needs_fill, d.llen, data_elems + fill_elems);

        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        facts
    })
}

#[test]
fn test_s3_hole_filling_box() {
    let (results, fs) = hole_filling(Rearranger::Box);
    let data = bytes_to_i32s(&fs.var_data("s3.nc", "data").unwrap());
    assert_eq!(data, vec![10, -1, 30, -1, -1, -1, -1, -1]);
    for (needs_fill, _, _) in &results {
        assert!(needs_fill);
    }
}

#[test]
fn test_s3_hole_filling_subset() {
    let (results, fs) = hole_filling(Rearranger::Subset);
    let data = bytes_to_i32s(&fs.var_data("s3.nc", "data").unwrap());
    assert_eq!(data, vec![10, -1, 30, -1, -1, -1, -1, -1]);
    // Hole complement: data and fill regions together tile the array, and
    // llen counts only the data elements.
    let io = &results[0];
    assert!(io.0);
    assert_eq!(io.1, 2);
    assert_eq!(io.2, 8);
}

#[test]
fn test_s4_read_only_duplicates() {
    let (results, _fs) = run_ranks(4, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let (ncid, varid) = simple_file(&mut pio, sys, "s4.nc", 4);

        // Seed the file through a clean block decomposition.
        let seed_map: Vec<i64> = vec![rank as i64 + 1];
        let seed = pio
            .init_decomp(sys, PioType::Int, &[4], &seed_map, None, None, None)
            .unwrap();
        let seed_vals = vec![(rank as i32 + 1) * 100];
        pio.write_darray(ncid, varid, seed, &i32s_to_bytes(&seed_vals), None, true)
            .unwrap();

        // The duplicated map: init succeeds but is read-only.
        let map: Vec<i64> = if rank == 0 { vec![1, 1, 2] } else { vec![] };
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[4], &map, None, None, None)
            .unwrap();
        let read_only = pio.decomp(ioid).unwrap().read_only;

        let nd = map.len();
        let write_err = pio
            .write_darray(ncid, varid, ioid, &i32s_to_bytes(&vec![0; nd]), None, true)
            .unwrap_err();

        let mut out = vec![0u8; nd * 4];
        pio.read_darray(ncid, varid, ioid, &mut out).unwrap();
        let got = bytes_to_i32s(&out);

        pio.close_file(ncid).unwrap();
        pio.free_decomp(seed).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        (read_only, write_err, got)
    });

    for (read_only, write_err, _) in &results {
        assert!(*read_only);
        assert_eq!(*write_err, Error::InvalidDecomposition);
    }
    // Rank 0 reads the duplicated offsets: file[0] twice, then file[1].
    assert_eq!(results[0].2, vec![100, 100, 200]);
}

fn cyclic_write(rearr: Rearranger, opts: Option<RearrOpts>, path: &'static str) -> MemFs {
    let (_, fs) = run_ranks(4, move |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 2, 2, rearr);
        pio.set_blocksize(1).unwrap();
        if let Some(o) = opts {
            pio.set_rearr_opts(sys, o).unwrap();
        }
        let (ncid, varid) = simple_file(&mut pio, sys, path, 16);

        let r = rank as i64;
        let map: Vec<i64> = vec![r + 1, r + 5, r + 9, r + 13];
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[16], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = map.iter().map(|&g| (g * 7) as i32).collect();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
            .unwrap();
        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
    });
    fs
}

#[test]
fn test_s5_subset_box_equivalence() {
    let box_fs = cyclic_write(Rearranger::Box, None, "s5.nc");
    let subset_fs = cyclic_write(Rearranger::Subset, None, "s5.nc");
    let a = box_fs.var_data("s5.nc", "data").unwrap();
    let b = subset_fs.var_data("s5.nc", "data").unwrap();
    assert_eq!(a, b);
    assert_eq!(
        bytes_to_i32s(&a),
        (1..=16).map(|g| g * 7).collect::<Vec<i32>>()
    );
}

#[test]
fn test_p2p_flow_control_matches_collective() {
    let coll = cyclic_write(Rearranger::Box, None, "fc.nc");
    let p2p_opts = RearrOpts {
        comm_type: CommType::P2p,
        fcd: FlowDir::Both,
        comp2io: FlowOpts {
            hs: true,
            isend: true,
            max_pend_req: 1,
        },
        io2comp: FlowOpts {
            hs: true,
            isend: false,
            max_pend_req: 2,
        },
    };
    let p2p = cyclic_write(Rearranger::Box, Some(p2p_opts), "fc.nc");
    assert_eq!(
        coll.var_data("fc.nc", "data").unwrap(),
        p2p.var_data("fc.nc", "data").unwrap()
    );
}

#[test]
fn test_box_regions_tile_without_holes() {
    let (results, _fs) = run_ranks(4, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 2, 2, Rearranger::Box);
        pio.set_blocksize(1).unwrap();
        let r = rank as i64;
        let map: Vec<i64> = vec![r + 1, r + 5, r + 9, r + 13];
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[16], &map, None, None, None)
            .unwrap();
        let d = pio.decomp(ioid).unwrap();
        let facts = (
            d.needs_fill,
            d.regions
                .iter()
                .map(|reg| (reg.start[0], reg.count[0]))
                .collect::<Vec<_>>(),
        );
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        facts
    });

    // I/O ranks are 0 and 2; their chunks are disjoint and cover [0, 16).
    for (needs_fill, _) in &results {
        assert!(!needs_fill);
    }
    let mut spans: Vec<(i64, i64)> = results
        .iter()
        .flat_map(|(_, regions)| regions.clone())
        .collect();
    spans.sort_unstable();
    assert_eq!(spans, vec![(0, 8), (8, 8)]);
}

#[test]
fn test_roundtrip_identity_with_sort() {
    let (results, _fs) = run_ranks(2, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let (ncid, varid) = simple_file(&mut pio, sys, "rt.nc", 8);

        // Backwards maps force the sort/remap path.
        let map: Vec<i64> = if rank == 0 {
            vec![7, 5, 3, 1]
        } else {
            vec![8, 6, 4, 2]
        };
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        assert!(pio.decomp(ioid).unwrap().needs_sort);

        let vals: Vec<i32> = map.iter().map(|&g| (g * 100) as i32).collect();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
            .unwrap();

        let mut out = vec![0u8; vals.len() * 4];
        pio.read_darray(ncid, varid, ioid, &mut out).unwrap();
        let ok = bytes_to_i32s(&out) == vals;

        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        ok
    });
    assert!(results.into_iter().all(|ok| ok));
}

#[test]
fn test_fill_value_read_back() {
    // Write through a decomposition with holes, read back with a full one:
    // uncovered indices yield the fill value.
    let (results, _fs) = run_ranks(4, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Subset);
        let (ncid, varid) = simple_file(&mut pio, sys, "fill.nc", 8);

        let sparse_map: Vec<i64> = match rank {
            0 => vec![1],
            1 => vec![3],
            _ => vec![0],
        };
        let sparse = pio
            .init_decomp(sys, PioType::Int, &[8], &sparse_map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = match rank {
            0 => vec![10],
            1 => vec![30],
            _ => vec![0],
        };
        let fill = (-1i32).to_le_bytes();
        pio.write_darray(ncid, varid, sparse, &i32s_to_bytes(&vals), Some(&fill), true)
            .unwrap();

        let full_map: Vec<i64> = vec![2 * rank as i64 + 1, 2 * rank as i64 + 2];
        let full = pio
            .init_decomp(sys, PioType::Int, &[8], &full_map, None, None, None)
            .unwrap();
        let mut out = vec![0u8; 8];
        pio.read_darray(ncid, varid, full, &mut out).unwrap();
        let got = bytes_to_i32s(&out);

        pio.close_file(ncid).unwrap();
        pio.free_decomp(sparse).unwrap();
        pio.free_decomp(full).unwrap();
        pio.finalize(sys).unwrap();
        got
    });

    let expected = [10, -1, 30, -1, -1, -1, -1, -1];
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got, &expected[2 * rank..2 * rank + 2]);
    }
}

#[test]
fn test_multi_variable_buffering() {
    let (_, fs) = run_ranks(2, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let ncid = pio
            .create_file(sys, IOTYPE_MEM, "multi.nc", OpenMode::WRITE | OpenMode::CLOBBER)
            .unwrap();
        let dim = pio.def_dim(ncid, "x", 8).unwrap();
        let va = pio.def_var(ncid, "a", PioType::Int, &[dim]).unwrap();
        let vb = pio.def_var(ncid, "b", PioType::Int, &[dim]).unwrap();
        let vc = pio.def_var(ncid, "c", PioType::Int, &[dim]).unwrap();
        pio.enddef(ncid).unwrap();

        let r = rank as i64;
        let map: Vec<i64> = (4 * r + 1..=4 * r + 4).collect();
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[8], &map, None, None, None)
            .unwrap();

        // Three appends share the buffer entry; sync drains them in order.
        for (varid, mult) in [(va, 1i32), (vb, 10), (vc, 100)] {
            let vals: Vec<i32> = map.iter().map(|&g| g as i32 * mult).collect();
            pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, false)
                .unwrap();
        }
        pio.sync_file(ncid).unwrap();

        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
    });

    assert_eq!(
        bytes_to_i32s(&fs.var_data("multi.nc", "a").unwrap()),
        (1..=8).collect::<Vec<i32>>()
    );
    assert_eq!(
        bytes_to_i32s(&fs.var_data("multi.nc", "b").unwrap()),
        (1..=8).map(|g| g * 10).collect::<Vec<i32>>()
    );
    assert_eq!(
        bytes_to_i32s(&fs.var_data("multi.nc", "c").unwrap()),
        (1..=8).map(|g| g * 100).collect::<Vec<i32>>()
    );
}

#[test]
fn test_buffer_limit_triggers_flush() {
    let (_, fs) = run_ranks(2, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        pio.set_buffer_size_limit(16);
        let (ncid, varid) = simple_file(&mut pio, sys, "limit.nc", 8);

        let r = rank as i64;
        let map: Vec<i64> = (4 * r + 1..=4 * r + 4).collect();
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[8], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = map.iter().map(|&g| g as i32).collect();
        // 8 elements * 4 bytes projected > 16: flushes without being asked.
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, false)
            .unwrap();

        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
    });
    assert_eq!(
        bytes_to_i32s(&fs.var_data("limit.nc", "data").unwrap()),
        (1..=8).collect::<Vec<i32>>()
    );
}

#[test]
fn test_s6_async_setframe_roundtrip() {
    let (results, fs) = run_ranks(5, |rank, comm, fs| {
        let mut pio = Pario::new();
        pio.set_default_error_handling(ErrorHandler::Return);
        pio.register_driver(IOTYPE_MEM, Box::new(MemDriver::new(fs.clone())));

        let init = pio
            .init_async(&comm, &[0, 1], &[vec![2, 3, 4]], Rearranger::Box)
            .unwrap();
        match init {
            pario_core::InitAsync::IoDone => (pio.dispatch_trace().to_vec(), Vec::new()),
            pario_core::InitAsync::Comp { iosysids } => {
                let sys = iosysids[0];
                let ncid = pio
                    .create_file(sys, IOTYPE_MEM, "async.nc", OpenMode::WRITE | OpenMode::CLOBBER)
                    .unwrap();
                let t = pio.def_dim(ncid, "time", UNLIMITED).unwrap();
                let x = pio.def_dim(ncid, "x", 6).unwrap();
                let varid = pio.def_var(ncid, "v", PioType::Int, &[t, x]).unwrap();
                pio.enddef(ncid).unwrap();

                let c = rank as i64 - 2;
                let map: Vec<i64> = vec![2 * c + 1, 2 * c + 2];
                let ioid = pio
                    .init_decomp(sys, PioType::Int, &[6], &map, None, None, None)
                    .unwrap();

                pio.set_frame(ncid, varid, 7).unwrap();
                let vals: Vec<i32> = vec![10 * c as i32 + 1, 10 * c as i32 + 2];
                pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
                    .unwrap();

                let mut out = vec![0u8; 8];
                pio.read_darray(ncid, varid, ioid, &mut out).unwrap();

                pio.close_file(ncid).unwrap();
                pio.free_decomp(ioid).unwrap();
                pio.finalize(sys).unwrap();
                (Vec::new(), bytes_to_i32s(&out))
            }
        }
    });

    // Frame 7 of variable v holds each component rank's values.
    let data = bytes_to_i32s(&fs.var_data("async.nc", "v").unwrap());
    assert_eq!(data.len(), 8 * 6);
    assert_eq!(&data[7 * 6..], &[1, 2, 11, 12, 21, 22]);
    assert!(data[..7 * 6].iter().all(|&v| v == 0));

    // Every computational rank got its values back.
    assert_eq!(results[2].1, vec![1, 2]);
    assert_eq!(results[3].1, vec![11, 12]);
    assert_eq!(results[4].1, vec![21, 22]);

    // Deterministic dispatch: both I/O ranks executed the same sequence,
    // and it includes the frame update.
    let trace0 = &results[0].0;
    let trace1 = &results[1].0;
    assert_eq!(trace0, trace1);
    assert!(trace0.contains(&(pario_core::MsgTag::SetFrame as i32)));
    let expected = vec![
        pario_core::MsgTag::CreateFile as i32,
        pario_core::MsgTag::DefDim as i32,
        pario_core::MsgTag::DefDim as i32,
        pario_core::MsgTag::DefVar as i32,
        pario_core::MsgTag::Enddef as i32,
        pario_core::MsgTag::InitDecomp as i32,
        pario_core::MsgTag::SetFrame as i32,
        pario_core::MsgTag::WriteDarrayMulti as i32,
        pario_core::MsgTag::ReadDarray as i32,
        pario_core::MsgTag::CloseFile as i32,
        pario_core::MsgTag::FreeDecomp as i32,
        pario_core::MsgTag::Exit as i32,
    ];
    assert_eq!(trace0, &expected);
}

#[test]
fn test_decomp_file_roundtrip() {
    let (results, fs) = run_ranks(2, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        // A backwards map checks that rows come out in caller order.
        let map: Vec<i64> = if rank == 0 { vec![4, 2] } else { vec![3, 1, 0] };
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[4], &map, None, None, None)
            .unwrap();
        pio.write_decomp(ioid, IOTYPE_MEM, "decomp.nc", "test decomp", "created by tests")
            .unwrap();
        let (gdims, row) = pio.read_decomp(sys, IOTYPE_MEM, "decomp.nc").unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        (gdims, row, map)
    });

    for (gdims, row, map) in &results {
        assert_eq!(gdims, &vec![4]);
        assert_eq!(row, map);
    }

    // The file carries the format's attributes and shapes.
    let driver = MemDriver::new(fs);
    let f = driver.open("decomp.nc", OpenMode::empty()).unwrap();
    assert!(f.get_att_text("library_version").unwrap().starts_with("pario-"));
    assert_eq!(f.get_att_text("array_order").unwrap(), "C");
    assert_eq!(f.get_att_text("title").unwrap(), "test decomp");
    assert_eq!(f.get_att_int("max_maplen").unwrap(), 3);
    assert_eq!(f.inq_dimlen("task").unwrap(), 2);
    assert_eq!(f.inq_dimlen("dims").unwrap(), 1);
}

#[test]
fn test_async_rearranger_override_rejected() {
    let (results, _fs) = run_ranks(3, |_rank, comm, fs| {
        let mut pio = Pario::new();
        pio.set_default_error_handling(ErrorHandler::Return);
        pio.register_driver(IOTYPE_MEM, Box::new(MemDriver::new(fs.clone())));
        let init = pio
            .init_async(&comm, &[0], &[vec![1, 2]], Rearranger::Box)
            .unwrap();
        match init {
            pario_core::InitAsync::IoDone => None,
            pario_core::InitAsync::Comp { iosysids } => {
                let sys = iosysids[0];
                let err = pio
                    .init_decomp(sys, PioType::Int, &[4], &[1], Some(Rearranger::Subset), None, None)
                    .unwrap_err();
                pio.finalize(sys).unwrap();
                Some(err)
            }
        }
    });
    assert_eq!(results[1], Some(Error::BadRearranger));
    assert_eq!(results[2], Some(Error::BadRearranger));
}

#[test]
fn test_write_requires_data_mode() {
    let (results, _fs) = run_ranks(1, |_rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let ncid = pio
            .create_file(sys, IOTYPE_MEM, "defmode.nc", OpenMode::WRITE | OpenMode::CLOBBER)
            .unwrap();
        let dim = pio.def_dim(ncid, "x", 4).unwrap();
        let varid = pio.def_var(ncid, "data", PioType::Int, &[dim]).unwrap();
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[4], &[1, 2, 3, 4], None, None, None)
            .unwrap();
        // Still in define mode: refused with no side effects.
        let err = pio
            .write_darray(ncid, varid, ioid, &i32s_to_bytes(&[1, 2, 3, 4]), None, true)
            .unwrap_err();
        pio.enddef(ncid).unwrap();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&[1, 2, 3, 4]), None, true)
            .unwrap();
        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        err
    });
    assert_eq!(results[0], Error::InvalidArgument);
}

#[test]
fn test_type_conversion_on_disk() {
    // Decomposition in Int, variable declared Double: values convert on
    // the way to disk and back.
    let (results, fs) = run_ranks(2, |rank, comm, fs| {
        let (mut pio, sys) = new_context(&comm, &fs, 1, 1, Rearranger::Box);
        let ncid = pio
            .create_file(sys, IOTYPE_MEM, "conv.nc", OpenMode::WRITE | OpenMode::CLOBBER)
            .unwrap();
        let dim = pio.def_dim(ncid, "x", 4).unwrap();
        let varid = pio.def_var(ncid, "data", PioType::Double, &[dim]).unwrap();
        pio.enddef(ncid).unwrap();

        let r = rank as i64;
        let map: Vec<i64> = vec![2 * r + 1, 2 * r + 2];
        let ioid = pio
            .init_decomp(sys, PioType::Int, &[4], &map, None, None, None)
            .unwrap();
        let vals: Vec<i32> = map.iter().map(|&g| g as i32 + 40).collect();
        pio.write_darray(ncid, varid, ioid, &i32s_to_bytes(&vals), None, true)
            .unwrap();

        let mut out = vec![0u8; 8];
        pio.read_darray(ncid, varid, ioid, &mut out).unwrap();
        let ok = bytes_to_i32s(&out) == vals;

        pio.close_file(ncid).unwrap();
        pio.free_decomp(ioid).unwrap();
        pio.finalize(sys).unwrap();
        ok
    });
    assert!(results.into_iter().all(|ok| ok));

    let raw = fs.var_data("conv.nc", "data").unwrap();
    let doubles = pario_core::types::bytes_to_f64s(&raw);
    assert_eq!(doubles, vec![41.0, 42.0, 43.0, 44.0]);
}
