// vim: tw=80
//! Asynchronous command execution

mod basic {
    use crate::*;
    use ocssd_core::{
        addr::Addr,
        async_ctx::{Admission, AsyncContext, Completion, Pending},
        buf,
        cmd::{Command, Transfer},
        dev::Device,
        nvme::Opcode,
        options::DeviceOptions,
        Error,
        Ret,
    };
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    type Completions = Arc<Mutex<Vec<Completion>>>;

    fn collector(done: &Completions) -> Box<dyn FnOnce(Completion) + Send> {
        let done = done.clone();
        Box::new(move |c| done.lock().unwrap().push(c))
    }

    fn unit_addrs(chunk: u16, unit: u32) -> Vec<Addr> {
        (0..4).map(|s| Addr::linear(0, 1, chunk, unit * 4 + s)).collect()
    }

    fn write(dev: &Device, chunk: u16, unit: u32, fill: u8)
        -> Command<'static>
    {
        let mut data = t!(buf::alloc_iovec(dev.geometry(), 4 * 512));
        buf::fill_char(&mut data, fill);
        t!(Command::write(dev, &unit_addrs(chunk, unit), Transfer::Buf(data),
                          Transfer::None, dev.pmode()))
    }

    fn read(dev: &Device, chunk: u16, unit: u32) -> Command<'static> {
        let data = t!(buf::alloc_iovec(dev.geometry(), 4 * 512));
        t!(Command::read(dev, &unit_addrs(chunk, unit), Transfer::Buf(data),
                         Transfer::None, dev.pmode()))
    }

    #[test]
    fn write_then_read() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let done = Completions::default();
        let mut ctx = t!(AsyncContext::init(&dev, 16));
        for unit in 0..4 {
            let p = Pending::new(write(&dev, 2, unit, b'a' + unit as u8),
                                 collector(&done));
            assert!(t!(ctx.submit(p)).is_admitted());
        }
        assert_eq!(t!(ctx.wait()), 4);
        assert_eq!(ctx.outstanding(), 0);
        assert!(done.lock().unwrap().iter().all(|c| c.result.is_ok()));
        done.lock().unwrap().clear();

        for unit in 0..4 {
            let p = Pending::new(read(&dev, 2, unit), collector(&done));
            assert!(t!(ctx.submit(p)).is_admitted());
        }
        assert_eq!(t!(ctx.wait()), 4);
        let completions = std::mem::take(&mut *done.lock().unwrap());
        for (unit, c) in completions.into_iter().enumerate() {
            assert_eq!(c.result, Ok(()));
            let data = c.cmd.data.into_buf().unwrap();
            assert!(data.iter().all(|&b| b == b'a' + unit as u8));
        }
        t!(ctx.term());
    }

    #[test]
    fn backpressure() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let done = Completions::default();
        let mut ctx = t!(AsyncContext::init(&dev, 2));
        let mut retry = None;
        for unit in 0..3 {
            let p = Pending::new(write(&dev, 0, unit, b'x'), collector(&done));
            match t!(ctx.submit(p)) {
                Admission::Admitted => (),
                Admission::TryAgain(p) => retry = Some(p),
            }
        }
        assert_eq!(ctx.outstanding(), 2);
        let p = retry.expect("third submission should have been refused");
        assert_eq!(t!(ctx.poke(1)), 1);
        assert!(t!(ctx.submit(p)).is_admitted());
        assert_eq!(t!(ctx.wait()), 2);
        assert_eq!(done.lock().unwrap().len(), 3);
        assert_eq!(emu.ncommands(Opcode::Write), 3);
        t!(ctx.term());
    }

    #[test]
    fn device_error() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let done = Completions::default();
        let mut ctx = t!(AsyncContext::init(&dev, 4));
        t!(ctx.submit(Pending::new(write(&dev, 1, 0, b'y'), collector(&done))));
        // Rewriting the same sectors without an erase
        t!(ctx.submit(Pending::new(write(&dev, 1, 0, b'z'), collector(&done))));
        t!(ctx.wait());
        let done = done.lock().unwrap();
        assert_eq!(done[0].result, Ok(()));
        assert_eq!(done[1].result, Err(Error::EIO));
        assert!(done[1].ret.is_device_error());
        assert_eq!(done[1].ret, done[1].cmd.ret);
    }

    #[test]
    fn submit_with() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        let done = Completions::default();
        let mut ctx = t!(AsyncContext::init(&dev, 1));
        let adm = t!(ctx.submit_with(|dev| {
            Command::erase(dev, &[Addr::linear(1, 1, 1, 0)], dev.pmode())
        }, collector(&done)));
        assert!(adm.is_admitted());
        let r = ctx.submit_with(|dev| {
            Command::erase(dev, &[Addr::linear(9, 1, 1, 0)], dev.pmode())
        }, collector(&done));
        assert_eq!(r.err(), Some(Error::EINVAL));
        assert_eq!(t!(ctx.wait()), 1);
        assert_eq!(done.lock().unwrap()[0].ret, Ret::default());
        t!(ctx.term());
        assert_eq!(ctx.term(), Err(Error::EINVAL));
    }

    #[test]
    fn depth_limits() {
        let emu = Emulator::new(linear_geometry());
        let dev = device(&emu, &DeviceOptions::default());
        assert_eq!(AsyncContext::init(&dev, 0).err(), Some(Error::EINVAL));
        assert_eq!(AsyncContext::init(&dev, 1 << 20).err(),
                   Some(Error::EINVAL));
    }
}
