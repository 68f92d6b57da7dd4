#[cfg(test)]
#[cfg(feature = "arena")]
mod tests {
    use std::{fmt, sync::Mutex};

    use kasan::{
        Kasan, KasanConfig,
        allocator::backend::bump::BumpBackend,
        logger::{KasanLogger, LogSink},
        report::LOG_TAG,
        shadow::memory::ArenaMemory,
    };
    use log::{Level, Log, Record};

    #[derive(Debug)]
    struct CaptureSink {
        lines: Mutex<Vec<(String, Level, String)>>,
    }

    impl CaptureSink {
        const fn new() -> CaptureSink {
            CaptureSink {
                lines: Mutex::new(Vec::new()),
            }
        }

        fn take(&self, tag: &str) -> Vec<String> {
            let mut lines = self.lines.lock().unwrap();
            let taken = lines
                .iter()
                .filter(|(t, _, _)| t == tag)
                .map(|(_, _, m)| m.clone())
                .collect();
            lines.clear();
            taken
        }
    }

    impl LogSink for CaptureSink {
        fn write(&self, tag: &str, level: Level, message: &fmt::Arguments<'_>) {
            self.lines
                .lock()
                .unwrap()
                .push((tag.to_string(), level, message.to_string()));
        }
    }

    static LOGGER: KasanLogger<CaptureSink> = KasanLogger::new(CaptureSink::new(), Level::Info);

    #[test]
    fn test_report_format() {
        LOGGER.install().unwrap();
        // Later installs are ignored
        LOGGER.install().unwrap();

        let arena = ArenaMemory::new(0x10000).unwrap();
        let heap = arena.start() + 0x1000;
        let translator = arena.translator();
        let kasan = Kasan::new(arena, translator, KasanConfig::default()).unwrap();
        kasan.initialize(kasan.shadow().memory()).unwrap();
        let mut backend = unsafe { BumpBackend::new(heap, 0x1000, 64) }.unwrap();
        let p = kasan.allocate(&mut backend, 10).unwrap();
        LOGGER.sink().take(LOG_TAG);

        let violation = kasan.store(p + 11, 1, 0x8a3c).unwrap_err();
        let lines = LOGGER.sink().take(LOG_TAG);
        let shadow = kasan.shadow().to_shadow(p + 8);
        assert_eq!(violation.shadow_addr, shadow);

        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "===================================================");
        assert_eq!(
            lines[1],
            format!(
                "Invalid memory access: address {:#X}, size 0x1, is_write 1, ip 0x8A3C",
                p + 11
            )
        );
        assert_eq!(
            lines[2],
            format!(
                "heap-buffer-overflow - WRITE of size 0x1 at {:#x}, shadow {shadow:#x}: 0x02",
                p + 11
            )
        );
        assert_eq!(
            lines[3],
            format!(
                "Shadow bytes around the buggy address {:#X} (shadow {shadow:#X}):",
                p + 8
            )
        );
        let row = shadow & !15;
        assert_eq!(
            lines[4],
            format!(
                "{:#X}: 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00",
                row - 48
            )
        );
        assert_eq!(
            lines[7],
            format!("{row:#X}: 00[02]FB FB FB FB 00 00 00 00 00 00 00 00 00 00")
        );
        assert!(lines[10].starts_with(&format!("{:#X}:", row + 48)));

        // Valid accesses are silent
        assert_eq!(kasan.load(p, 10, 0), Ok(()));
        assert!(LOGGER.sink().take(LOG_TAG).is_empty());
    }

    #[test]
    fn test_level_filter() {
        let logger = KasanLogger::new(CaptureSink::new(), Level::Warn);
        logger.log(
            &Record::builder()
                .args(format_args!("dropped"))
                .level(Level::Debug)
                .target("kasan")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("kept {}", 1))
                .level(Level::Error)
                .target("kasan")
                .build(),
        );
        assert_eq!(logger.sink().take("kasan"), vec!["kept 1".to_string()]);
    }
}
