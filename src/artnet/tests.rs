#[cfg(test)]
mod test_frame {
    use crate::artnet::transmitter::{build_frame, DMX_DATA_OFFSET};

    #[test]
    fn frame_layout_is_bit_exact() {
        let mut channels = [0u8; 512];
        channels[0] = 0xff;
        channels[1] = 0x80;

        let frame = build_frame(3, 7, &channels);

        assert_eq!(frame.len(), 530);
        assert_eq!(&frame[0..8], b"Art-Net\0");
        assert_eq!(frame[8], 0x00); // OpCode lo
        assert_eq!(frame[9], 0x50); // OpCode hi
        assert_eq!(frame[10], 0x00); // Protocol version hi
        assert_eq!(frame[11], 0x0e); // Protocol version lo
        assert_eq!(frame[12], 7); // Sequence
        assert_eq!(frame[13], 0); // Physical
        assert_eq!(frame[14], 3); // Universe lo
        assert_eq!(frame[15], 0); // Universe hi
        assert_eq!(frame[16], 0x02); // Length hi
        assert_eq!(frame[17], 0x00); // Length lo
        assert_eq!(frame[DMX_DATA_OFFSET], 0xff);
        assert_eq!(frame[DMX_DATA_OFFSET + 1], 0x80);
        assert!(frame[DMX_DATA_OFFSET + 2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn universe_is_little_endian() {
        let channels = [0u8; 512];
        let frame = build_frame(0x0102, 1, &channels);

        assert_eq!(frame[14], 0x02);
        assert_eq!(frame[15], 0x01);
    }
}

#[cfg(test)]
mod test_transmitter {
    use crate::artnet::transmitter::DMX_DATA_OFFSET;
    use crate::artnet::Transmitter;
    use crate::stage::model::Device;
    use std::net::{IpAddr, UdpSocket};
    use std::str::FromStr;
    use std::time::Duration;

    fn test_device(id: &str, start_channel: u16, values: Vec<u8>) -> Device {
        Device {
            id: id.to_string(),
            name: format!("{} fixture", id),
            ip: IpAddr::from_str("127.0.0.1").unwrap(),
            universe: 0,
            start_channel,
            channel_count: values.len() as u16,
            device_type: "rgb".to_string(),
            fixture_id: None,
            channel_layout: None,
            values,
        }
    }

    #[test]
    fn sequence_counter_wraps_without_zero() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let ip = IpAddr::from_str("127.0.0.1").unwrap();

        let mut previous = 0u8;
        for i in 0..600 {
            let sequence = transmitter.next_sequence(ip, 0);
            assert!((1..=255).contains(&sequence), "sequence {} at step {}", sequence, i);
            if previous == 255 {
                assert_eq!(sequence, 1);
            }
            previous = sequence;
        }
    }

    #[test]
    fn sequence_counters_are_per_universe() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let ip = IpAddr::from_str("127.0.0.1").unwrap();

        assert_eq!(transmitter.next_sequence(ip, 0), 1);
        assert_eq!(transmitter.next_sequence(ip, 0), 2);
        assert_eq!(transmitter.next_sequence(ip, 1), 1);
    }

    #[test]
    fn identical_frames_are_deduplicated() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let device = test_device("device_1", 1, vec![255, 128, 0]);

        assert!(transmitter.send_device(&device));
        assert!(transmitter.send_device(&device));
        assert_eq!(transmitter.sent_log.len(), 1);

        let mut changed = device.clone();
        changed.values[0] = 10;
        assert!(transmitter.send_device(&changed));
        assert_eq!(transmitter.sent_log.len(), 2);
    }

    #[test]
    fn dedup_cache_is_per_device() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let one = test_device("device_1", 1, vec![9, 9, 9]);
        let two = test_device("device_2", 1, vec![9, 9, 9]);

        assert!(transmitter.send_device(&one));
        assert!(transmitter.send_device(&two));
        assert_eq!(transmitter.sent_log.len(), 2);
    }

    #[test]
    fn forget_device_invalidates_cache() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let device = test_device("device_1", 1, vec![1, 2, 3]);

        assert!(transmitter.send_device(&device));
        transmitter.forget_device(&device.id);
        assert!(transmitter.send_device(&device));
        assert_eq!(transmitter.sent_log.len(), 2);
    }

    // Channels outside the device's start_channel window are always zero:
    // the last writer of a shared (ip, universe) pair wins for the whole
    // frame. One device per universe is the supported topology.
    #[test]
    fn frame_zeroes_outside_device_window() {
        let mut transmitter = Transmitter::new(true).unwrap();
        let device = test_device("device_1", 10, vec![1, 2, 3]);

        assert!(transmitter.send_device(&device));

        let (_, frame) = &transmitter.sent_log[0];
        assert_eq!(frame[DMX_DATA_OFFSET + 9], 1);
        assert_eq!(frame[DMX_DATA_OFFSET + 10], 2);
        assert_eq!(frame[DMX_DATA_OFFSET + 11], 3);

        for (i, &byte) in frame[DMX_DATA_OFFSET..].iter().enumerate() {
            if !(9..=11).contains(&i) {
                assert_eq!(byte, 0, "channel offset {} should be zero", i);
            }
        }
    }

    #[test]
    fn sends_530_byte_datagram_over_udp() {
        // Claim the Art-Net port on loopback; skip if something else has it.
        let receiver = match UdpSocket::bind("127.0.0.1:6454") {
            Ok(socket) => socket,
            Err(_) => return,
        };
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut transmitter = Transmitter::new(false).unwrap();
        let device = test_device("device_1", 1, vec![255, 128, 0]);
        assert!(transmitter.send_device(&device));

        let mut buffer = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buffer).unwrap();

        assert_eq!(len, 530);
        assert_eq!(&buffer[0..8], b"Art-Net\0");
        assert_eq!(buffer[18], 0xff);
        assert_eq!(buffer[19], 0x80);
        assert_eq!(buffer[20], 0x00);
    }
}
