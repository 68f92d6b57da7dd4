//! The scenarios of the platform's sanitizer demo, replayed against an arena:
//! a stack array overrun, heap overruns through `malloc`/`realloc`/`free`, an
//! array `new`/`delete` overrun and a static buffer overrun.
#[cfg(test)]
#[cfg(feature = "arena")]
mod tests {
    use kasan::{
        GuestAddr, Kasan, KasanConfig, ViolationKind,
        allocator::backend::bump::BumpBackend,
        globals::GlobalDescriptor,
        shadow::{PoisonType, memory::ArenaMemory},
    };
    use spin::Lazy;

    const ARENA_LEN: usize = 0x10000;

    static INIT_ONCE: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });

    struct Demo {
        kasan: Kasan<ArenaMemory>,
        backend: BumpBackend,
    }

    impl Demo {
        fn new() -> Demo {
            Lazy::force(&INIT_ONCE);
            let arena = ArenaMemory::new(ARENA_LEN).unwrap();
            let heap = arena.start() + 0x4000;
            let translator = arena.translator();
            let kasan = Kasan::new(arena, translator, KasanConfig::default()).unwrap();
            kasan.initialize(kasan.shadow().memory()).unwrap();
            let backend = unsafe { BumpBackend::new(heap, 0x4000, 64) }.unwrap();
            Demo { kasan, backend }
        }

        fn start(&self) -> GuestAddr {
            self.kasan.shadow().memory().start()
        }

        /// `memset(addr, 0, len)` through the checked path
        fn memset(&self, addr: GuestAddr, len: usize) -> Option<ViolationKind> {
            self.kasan.store(addr, len, 0).err().map(|v| v.kind)
        }

        fn read(&self, addr: GuestAddr) -> Option<ViolationKind> {
            self.kasan.load(addr, 1, 0).err().map(|v| v.kind)
        }

        fn write(&self, addr: GuestAddr, len: usize) -> Option<ViolationKind> {
            self.kasan.store(addr, len, 0).err().map(|v| v.kind)
        }
    }

    #[test]
    fn test_stack() {
        let demo = Demo::new();
        // char stack_array[11] between a 32 byte left and a 21 byte right redzone
        let frame = demo.start() + 0x2000;
        let array = frame + 32;
        let shadow = demo.kasan.shadow().to_shadow(frame);
        demo.kasan
            .set_shadow_tag(shadow, 4, PoisonType::AsanStackLeftRz)
            .unwrap();
        demo.kasan.unpoison(array, 11).unwrap();
        demo.kasan
            .set_shadow_tag(shadow + 6, 2, PoisonType::AsanStackRightRz)
            .unwrap();

        assert_eq!(
            demo.memset(array, 12),
            Some(ViolationKind::StackBufferOverflow)
        );
        assert_eq!(demo.read(array + 11), Some(ViolationKind::StackBufferOverflow));
        assert_eq!(demo.read(array - 1), Some(ViolationKind::StackBufferOverflow));
        assert_eq!(demo.memset(array, 11), None);
    }

    #[test]
    fn test_heap_malloc() {
        let mut demo = Demo::new();
        let p = demo.kasan.allocate(&mut demo.backend, 10).unwrap();
        assert_eq!(demo.write(p + 3, 1), None);
        assert_eq!(demo.write(p + 11, 1), Some(ViolationKind::HeapBufferOverflow));

        let p = unsafe { demo.kasan.reallocate(&mut demo.backend, p, 2) }.unwrap();
        assert_eq!(demo.read(p + 3), Some(ViolationKind::HeapBufferOverflow));

        unsafe { demo.kasan.free(&mut demo.backend, p) }.unwrap();
        assert_eq!(demo.read(p), Some(ViolationKind::HeapUseAfterFree));
    }

    #[test]
    fn test_heap_new() {
        // struct s_t { int a; char b[15]; } is 20 bytes
        const S: usize = 20;
        let mut demo = Demo::new();
        let s = demo.kasan.allocate(&mut demo.backend, 11 * S).unwrap();
        assert_eq!(demo.write(s + 3 * S + 4 + 9, 1), None);
        assert_eq!(
            demo.write(s + 11 * S, 4),
            Some(ViolationKind::HeapBufferOverflow)
        );

        unsafe { demo.kasan.free(&mut demo.backend, s) }.unwrap();
        assert_eq!(
            demo.read(s + 3 * S + 4 + 9),
            Some(ViolationKind::HeapUseAfterFree)
        );
    }

    #[test]
    fn test_static() {
        let demo = Demo::new();
        // static char static_buffer[10], padded to 64 bytes by the compiler
        let buffer = demo.start() + 0x1000;
        demo.kasan
            .register_globals(&[GlobalDescriptor::new(buffer, 10, 64)])
            .unwrap();

        assert_eq!(
            demo.memset(buffer, 12),
            Some(ViolationKind::GlobalBufferOverflow)
        );
        assert_eq!(demo.read(buffer + 11), Some(ViolationKind::GlobalBufferOverflow));
        // Known gap: nothing guards the bytes in front of a global
        assert_eq!(demo.read(buffer - 3), None);
    }
}
