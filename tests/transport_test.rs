mod common;

#[cfg(test)]
mod tests {
    use crate::common::{deliver, flush_tx, framed, Uart};
    use j1708_rs::{Error, Port, SessionState};

    fn transport_port(uart: &Uart) -> Port<Uart> {
        let mut port = Port::new(String::from("sp3"), uart, 3);
        port.set_gateway_processing(true);
        port
    }

    #[test]
    fn transmit_side_round_trip() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);
        let payload: Vec<u8> = (0..45).collect();

        // RTS announces 45 bytes in three segments
        assert_eq!(port.transport_send(&payload, 0xA1), Ok(3));
        assert_eq!(port.session_state(), SessionState::TxAwaitingCts);
        flush_tx(&mut port, &uart);
        assert_eq!(
            uart.written(),
            framed(&[120, 197, 5, 0xA1, 1, 3, 45, 0, 0])
        );

        // the receiver clears all three segments from the start
        deliver(&mut port, &uart, &framed(&[0xA1, 197, 4, 120, 2, 3, 1, 0]));
        port.update();
        assert_eq!(port.session_state(), SessionState::TxSending);

        for segment in 1..=3u8 {
            uart.clear_written();
            flush_tx(&mut port, &uart);
            let from = (segment as usize - 1) * 15;
            let mut body = vec![120, 198, 17, 0xA1, segment];
            body.extend(&payload[from..from + 15]);
            body.push(0);
            assert_eq!(uart.written(), framed(&body));
        }
        assert_eq!(port.session_state(), SessionState::TxAwaitingEom);

        deliver(&mut port, &uart, &framed(&[0xA1, 197, 2, 120, 3, 0]));
        port.update();
        assert_eq!(port.session_state(), SessionState::Idle);
    }

    #[test]
    fn receive_side_reassembles_payload() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);
        let payload: Vec<u8> = (100..135).collect();

        // 35 bytes: two full segments and a 5-byte tail
        deliver(&mut port, &uart, &framed(&[0xA1, 197, 5, 120, 1, 3, 35, 0, 0]));
        port.update();
        assert_eq!(port.session_state(), SessionState::RxAwaitingCdp);

        uart.clear_written();
        flush_tx(&mut port, &uart);
        assert_eq!(uart.written(), framed(&[120, 197, 4, 0xA1, 2, 3, 1, 0]));

        for segment in 1..=3u8 {
            let from = (segment as usize - 1) * 15;
            let to = (from + 15).min(payload.len());
            let n = to - from;
            let mut body = vec![0xA1, 198, n as u8 + 2, 120, segment];
            body.extend(&payload[from..to]);
            body.push(0);
            deliver(&mut port, &uart, &framed(&body));
            port.update();
        }

        assert_eq!(port.session_state(), SessionState::Idle);
        assert_eq!(port.transport_received(), &payload[..]);

        uart.clear_written();
        flush_tx(&mut port, &uart);
        assert_eq!(uart.written(), framed(&[120, 197, 2, 0xA1, 3, 0]));
    }

    #[test]
    fn rts_while_busy_is_refused() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);
        let payload: Vec<u8> = (0..20).collect();

        port.transport_send(&payload, 0xA1).unwrap();
        flush_tx(&mut port, &uart);

        // a second initiator shows up mid-session
        deliver(&mut port, &uart, &framed(&[0xB2, 197, 5, 120, 1, 2, 20, 0, 0]));
        port.update();

        // it gets an abort and our session is untouched
        uart.clear_written();
        flush_tx(&mut port, &uart);
        assert_eq!(uart.written(), framed(&[120, 197, 2, 0xB2, 255, 0]));
        assert_eq!(port.session_state(), SessionState::TxAwaitingCts);
    }

    #[test]
    fn oversized_rts_is_aborted() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);

        // 257 bytes claimed: more than the session buffer holds
        deliver(&mut port, &uart, &framed(&[0xA1, 197, 5, 120, 1, 18, 1, 1, 0]));
        port.update();

        uart.clear_written();
        flush_tx(&mut port, &uart);
        assert_eq!(uart.written(), framed(&[120, 197, 2, 0xA1, 255, 0]));
        assert_eq!(port.session_state(), SessionState::Idle);
    }

    #[test]
    fn foreign_abort_is_ignored() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);
        let payload: Vec<u8> = (0..20).collect();

        port.transport_send(&payload, 0xA1).unwrap();
        flush_tx(&mut port, &uart);

        deliver(&mut port, &uart, &framed(&[0xB2, 197, 2, 120, 255, 0]));
        port.update();

        assert_eq!(port.session_state(), SessionState::TxAwaitingCts);
    }

    #[test]
    fn session_times_out_with_abort() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);
        let payload: Vec<u8> = (0..20).collect();

        port.transport_send(&payload, 0xA1).unwrap();
        flush_tx(&mut port, &uart);

        // ten seconds pass with no CTS from the peer
        uart.advance_ms(10_050);
        port.update();
        assert_eq!(port.session_state(), SessionState::Idle);

        uart.clear_written();
        flush_tx(&mut port, &uart);
        assert_eq!(uart.written(), framed(&[120, 197, 2, 0xA1, 255, 0]));
    }

    #[test]
    fn payload_bounds_are_enforced() {
        let uart = Uart::new(true);
        let mut port = transport_port(&uart);

        let short: Vec<u8> = (0..10).collect();
        assert_eq!(port.transport_send(&short, 0xA1), Err(Error::PayloadSize(10)));

        let long = vec![0u8; 300];
        assert_eq!(port.transport_send(&long, 0xA1), Err(Error::PayloadSize(300)));

        let fine: Vec<u8> = (0..16).collect();
        assert_eq!(port.transport_send(&fine, 0xA1), Ok(2));
        // and a second session cannot start while one is open
        assert_eq!(port.transport_send(&fine, 0xB2), Err(Error::TransportBusy));
    }
}
