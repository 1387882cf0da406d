// vim: tw=80
//! Synchronous commands

mod planar {
    use crate::*;
    use crate::emulator::STATUS_WRITE_FAULT;
    use ocssd_core::{
        addr::Addr,
        buf,
        cmd,
        nvme::{Opcode, PlaneMode},
        options::DeviceOptions,
        Error,
        Ret,
    };
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    struct Harness {
        emu: Emulator,
        dev: ocssd_core::dev::Device,
    }

    #[fixture]
    fn harness() -> Harness {
        let emu = Emulator::new(planar_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        Harness { emu, dev }
    }

    /// One page on both planes of block `blk`
    fn page(blk: u16, pg: u16) -> Vec<Addr> {
        (0..2).flat_map(|pl| {
            (0..4).map(move |sec| Addr::planar(1, 0, pl, blk, pg, sec))
        }).collect()
    }

    #[rstest]
    fn write_read(harness: Harness) {
        let dev = &harness.dev;
        let addrs = page(3, 0);
        let mut wbuf = t!(buf::alloc(dev.geometry(), 8 * 512));
        buf::fill(&mut wbuf);
        let wmeta = vec![b'M'; 8 * 16];
        let mut ret = Ret::default();
        t!(cmd::write(dev, &addrs, &wbuf, Some(&wmeta), dev.pmode(),
                      Some(&mut ret)));
        assert!(ret.is_ok());

        let mut rbuf = t!(buf::alloc(dev.geometry(), 8 * 512));
        let mut rmeta = vec![0u8; 8 * 16];
        t!(cmd::read(dev, &addrs, &mut rbuf, Some(&mut rmeta), dev.pmode(),
                     None));
        assert_eq!(buf::diff(&wbuf, &rbuf), 0);
        assert_eq!(rmeta, wmeta);
    }

    #[rstest]
    fn write_without_erase(harness: Harness) {
        let dev = &harness.dev;
        let addrs = page(0, 1);
        let data = vec![b'a'; 8 * 512];
        t!(cmd::write(dev, &addrs, &data, None, dev.pmode(), None));
        let mut ret = Ret::default();
        let r = cmd::write(dev, &addrs, &data, None, dev.pmode(),
                           Some(&mut ret));
        assert_eq!(r, Err(Error::EIO));
        assert_eq!(ret.status, STATUS_WRITE_FAULT);
        assert!(ret.is_device_error());

        let erase = [Addr::planar(1, 0, 0, 0, 0, 0),
                     Addr::planar(1, 0, 1, 0, 0, 0)];
        t!(cmd::erase(dev, &erase, PlaneMode::Dual, None));
        t!(cmd::write(dev, &addrs, &data, None, dev.pmode(), None));
    }

    /// Erasing one plane leaves the other alone
    #[rstest]
    fn erase_single_plane(harness: Harness) {
        let dev = &harness.dev;
        let addrs = page(5, 0);
        let data = vec![b'b'; 8 * 512];
        t!(cmd::write(dev, &addrs, &data, None, dev.pmode(), None));
        t!(cmd::erase(dev, &[addrs[0]], PlaneMode::Single, None));
        assert_eq!(harness.emu.sector(addrs[0]), None);
        assert_eq!(harness.emu.sector(addrs[4]), Some(vec![b'b'; 512]));
    }

    #[rstest]
    fn wrong_sizes(harness: Harness) {
        let dev = &harness.dev;
        let addrs = page(0, 0);
        let short = vec![0u8; 7 * 512];
        assert_eq!(cmd::write(dev, &addrs, &short, None, dev.pmode(), None),
                   Err(Error::EINVAL));
        let data = vec![0u8; 8 * 512];
        let meta = vec![0u8; 16];
        assert_eq!(cmd::write(dev, &addrs, &data, Some(&meta), dev.pmode(),
                              None),
                   Err(Error::EINVAL));
        assert_eq!(cmd::erase(dev, &[], dev.pmode(), None), Err(Error::EINVAL));
        assert_eq!(harness.emu.ncommands(Opcode::Write), 0);
        assert_eq!(harness.emu.ncommands(Opcode::Erase), 0);
    }

    #[rstest]
    fn too_many_addrs(harness: Harness) {
        let mut dev = harness.dev;
        t!(dev.set_write_naddrs_max(4));
        let addrs = page(0, 0);
        let data = vec![0u8; 8 * 512];
        assert_eq!(cmd::write(&dev, &addrs, &data, None, dev.pmode(), None),
                   Err(Error::EINVAL));
        t!(cmd::write(&dev, &addrs[..4], &data[..4 * 512], None, dev.pmode(),
                      None));
    }

    #[rstest]
    fn out_of_range(harness: Harness) {
        let dev = &harness.dev;
        let bad = Addr::planar(2, 0, 0, 0, 0, 0);
        let mut data = vec![0u8; 512];
        assert_eq!(cmd::read(dev, &[bad], &mut data, None, dev.pmode(), None),
                   Err(Error::EINVAL));
    }

    /// Informational results don't fail the command
    #[rstest]
    fn acceptable_result(harness: Harness) {
        let dev = &harness.dev;
        let addrs = page(2, 0);
        harness.emu.inject(Opcode::Read, 0, Ret { result: 0x4700, status: 0 });
        let mut data = vec![0u8; 8 * 512];
        let mut ret = Ret::default();
        t!(cmd::read(dev, &addrs, &mut data, None, dev.pmode(),
                     Some(&mut ret)));
        assert_eq!(ret.result, 0x4700);
        assert!(ret.is_ok());
    }

    #[rstest]
    fn device_error(harness: Harness) {
        let dev = &harness.dev;
        harness.emu.inject(Opcode::Erase, 1, Ret { result: 0, status: 0x4281 });
        let blk = [Addr::planar(0, 1, 0, 6, 0, 0)];
        t!(cmd::erase(dev, &blk, PlaneMode::Single, None));
        let mut ret = Ret::default();
        assert_eq!(cmd::erase(dev, &blk, PlaneMode::Single, Some(&mut ret)),
                   Err(Error::EIO));
        assert_eq!(ret, Ret { result: 0, status: 0x4281 });
        t!(cmd::erase(dev, &blk, PlaneMode::Single, None));
        assert_eq!(harness.emu.ncommands(Opcode::Erase), 3);
    }

    #[rstest]
    fn copy_unsupported(harness: Harness) {
        let dev = &harness.dev;
        let src = [Addr::planar(0, 0, 0, 0, 0, 0)];
        let dst = [Addr::planar(0, 0, 0, 1, 0, 0)];
        assert_eq!(cmd::copy(dev, &src, &dst, None), Err(Error::ENOTSUP));
        assert_eq!(cmd::report(dev, None, None).unwrap_err(), Error::ENOTSUP);
    }

    #[rstest]
    fn identify(harness: Harness) {
        let id = t!(cmd::identify(&harness.dev, None));
        assert_eq!(t!(id.geometry()), *harness.emu.geometry());
        assert!(!id.vcopy());
    }
}

mod linear {
    use crate::*;
    use crate::emulator::{STATUS_BAD_BLOCK, STATUS_WRITE_FAULT};
    use ocssd_core::{
        addr::{Addr, DevAddr},
        cmd,
        nvme::chunk_state,
        options::DeviceOptions,
        Error,
        Ret,
    };
    use pretty_assertions::assert_eq;

    fn sectors(grp: u8, pu: u8, chunk: u16, first: u32, n: u32) -> Vec<Addr> {
        (first..first + n).map(|s| Addr::linear(grp, pu, chunk, s)).collect()
    }

    #[test]
    fn sequential_writes_only() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let data = vec![b's'; 4 * 512];
        let mut ret = Ret::default();
        let r = cmd::write(&dev, &sectors(0, 1, 2, 4, 4), &data, None,
                           dev.pmode(), Some(&mut ret));
        assert_eq!(r, Err(Error::EIO));
        assert_eq!(ret.status, STATUS_WRITE_FAULT);
        t!(cmd::write(&dev, &sectors(0, 1, 2, 0, 4), &data, None,
                      dev.pmode(), None));
        t!(cmd::write(&dev, &sectors(0, 1, 2, 4, 4), &data, None,
                      dev.pmode(), None));
    }

    #[test]
    fn copy() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        assert!(dev.vcopy());
        let src = sectors(1, 0, 0, 0, 4);
        let dst = sectors(0, 1, 7, 0, 4);
        let mut data = vec![0u8; 4 * 512];
        ocssd_core::buf::fill(&mut data);
        t!(cmd::write(&dev, &src, &data, None, dev.pmode(), None));
        t!(cmd::copy(&dev, &src, &dst, None));
        let mut rbuf = vec![0u8; 4 * 512];
        t!(cmd::read(&dev, &dst, &mut rbuf, None, dev.pmode(), None));
        assert_eq!(rbuf, data);
        assert_eq!(cmd::copy(&dev, &src, &dst[..2], None), Err(Error::EINVAL));
    }

    #[test]
    fn report() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let geo = *dev.geometry();
        let data = vec![0u8; 4 * 512];
        t!(cmd::write(&dev, &sectors(1, 1, 3, 0, 4), &data, None,
                      dev.pmode(), None));
        let full = vec![0u8; 48 * 512];
        for (addrs, data) in sectors(1, 1, 4, 0, 48).chunks(16)
            .zip(full.chunks(16 * 512))
        {
            t!(cmd::write(&dev, addrs, data, None, dev.pmode(), None));
        }
        emu.set_offline(Addr::linear(1, 1, 5, 0));

        let descrs = t!(cmd::report(&dev, Some(Addr::linear(1, 1, 0, 0)),
                                    None));
        assert_eq!(descrs.len(), 8);
        let states = descrs.iter().map(|d| d.state).collect::<Vec<_>>();
        assert_eq!(states[3], chunk_state::OPEN);
        assert_eq!(descrs[3].wptr, 4);
        assert_eq!(states[4], chunk_state::CLOSED);
        assert_eq!(states[5], chunk_state::OFFLINE);
        assert_eq!(states.iter().filter(|&&s| s == chunk_state::FREE).count(),
                   5);
        assert_eq!(t!(DevAddr(descrs[3].addr).to_generic(&geo)),
                   Addr::linear(1, 1, 3, 0));

        let all = t!(cmd::report(&dev, None, None));
        assert_eq!(all.len(), 32);
        assert_eq!(all[3 * 8 + 4].state, chunk_state::CLOSED);
    }

    #[test]
    fn offline_chunk() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        emu.set_offline(Addr::linear(0, 0, 1, 0));
        let mut ret = Ret::default();
        let r = cmd::erase(&dev, &[Addr::linear(0, 0, 1, 0)], dev.pmode(),
                           Some(&mut ret));
        assert_eq!(r, Err(Error::EIO));
        assert_eq!(ret.status, STATUS_BAD_BLOCK);
    }
}
